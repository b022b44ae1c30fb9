//! Graph intermediate representation.
//!
//! A [`Graph`] is a flat, ordered list of [`Equation`]s over [`Var`]s, with
//! constant binders, input binders, output atoms and an effect set. Graphs are
//! immutable once built; every transformation returns a new graph.

use crate::trace::effects::{renumber_effects, Effect, Effects};
use crate::trace::AbstractValue;
use crate::{Array, DType, Error, Result};
use ordered_float::OrderedFloat;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Source of `Var` ids, which fix a variable's identity and its printed `v<id>` name.
static VAR_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct VarData {
    id: usize,
    aval: AbstractValue,
    dropped: bool,
}

/// A graph variable.
///
/// Variables compare by identity: two variables with the same type are still
/// distinct unless one is a clone of the other.
#[derive(Clone)]
pub struct Var(Arc<VarData>);

impl Var {
    /// Create a fresh variable of the given type.
    pub fn new(aval: AbstractValue) -> Self {
        let id = VAR_COUNTER.fetch_add(1, Ordering::Relaxed);
        Var(Arc::new(VarData { id, aval, dropped: false }))
    }

    /// Create a placeholder for an equation output that nothing reads.
    pub fn drop_var(aval: AbstractValue) -> Self {
        let id = VAR_COUNTER.fetch_add(1, Ordering::Relaxed);
        Var(Arc::new(VarData { id, aval, dropped: true }))
    }

    /// Id of this variable, unique across the process.
    #[inline]
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Type of this variable.
    #[inline]
    pub fn aval(&self) -> &AbstractValue {
        &self.0.aval
    }

    /// Returns true for drop placeholders.
    #[inline]
    pub fn is_dropped(&self) -> bool {
        self.0.dropped
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl PartialOrd for Var {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Var {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self, self.aval())
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dropped() {
            write!(f, "_")
        } else {
            write!(f, "v{}", self.id())
        }
    }
}

/// A constant embedded directly in an equation's operand list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Literal {
    /// The constant.
    pub value: Array,
    /// Its type.
    pub aval: AbstractValue,
}

impl Literal {
    /// Wrap an array as a literal.
    pub fn new(value: Array) -> Self {
        let aval = AbstractValue::of_array(&value);
        Self { value, aval }
    }

    /// Whether a value is small enough to inline as a literal (rank 0).
    pub fn is_literalable(value: &Array) -> bool {
        value.is_scalar()
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.item() {
            Some(x) if self.value.is_scalar() => write!(f, "{}:{}", x, self.value.dtype()),
            _ => write!(f, "{}", self.value),
        }
    }
}

/// An equation operand or graph output: a variable or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Atom {
    /// Reference to a bound variable.
    Var(Var),
    /// Inline constant.
    Lit(Literal),
}

impl Atom {
    /// Type of the atom.
    pub fn aval(&self) -> &AbstractValue {
        match self {
            Atom::Var(v) => v.aval(),
            Atom::Lit(l) => &l.aval,
        }
    }

    /// The variable, if this atom is one.
    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Atom::Var(v) => Some(v),
            Atom::Lit(_) => None,
        }
    }

    /// Variables this atom reads: itself plus any dynamic dimensions.
    pub fn vars(&self) -> Vec<Var> {
        match self {
            Atom::Var(v) => {
                let mut out = vec![v.clone()];
                out.extend(v.aval().dim_vars().cloned());
                out
            }
            Atom::Lit(_) => Vec::new(),
        }
    }
}

impl From<Var> for Atom {
    fn from(v: Var) -> Self {
        Atom::Var(v)
    }
}

impl From<&Var> for Atom {
    fn from(v: &Var) -> Self {
        Atom::Var(v.clone())
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Var(v) => write!(f, "{}", v),
            Atom::Lit(l) => write!(f, "{}", l),
        }
    }
}

/// Primitive operations that equations apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Primitive {
    // Unary operations
    Neg,
    Sin,
    Cos,
    Exp,
    Log,
    Tanh,

    // Binary operations
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,

    // Linear algebra and reductions
    Dot,
    ReduceSum,

    // Structural
    ConvertElementType,
    Select,
    /// Apply the graph in the `call_jaxpr` parameter.
    Call,
    /// Move values between memory kinds; identity on the host.
    DevicePut,

    // Effectful
    DebugPrint,
    MutableArray,
    RefGet,
    RefSet,

    /// User-registered primitive.
    Custom(String),
}

impl Primitive {
    /// Printed name of the primitive.
    pub fn name(&self) -> &str {
        match self {
            Primitive::Neg => "neg",
            Primitive::Sin => "sin",
            Primitive::Cos => "cos",
            Primitive::Exp => "exp",
            Primitive::Log => "log",
            Primitive::Tanh => "tanh",
            Primitive::Add => "add",
            Primitive::Sub => "sub",
            Primitive::Mul => "mul",
            Primitive::Div => "div",
            Primitive::Max => "max",
            Primitive::Min => "min",
            Primitive::Dot => "dot",
            Primitive::ReduceSum => "reduce_sum",
            Primitive::ConvertElementType => "convert_element_type",
            Primitive::Select => "select",
            Primitive::Call => "call",
            Primitive::DevicePut => "device_put",
            Primitive::DebugPrint => "debug_print",
            Primitive::MutableArray => "mutable_array",
            Primitive::RefGet => "ref_get",
            Primitive::RefSet => "ref_set",
            Primitive::Custom(name) => name,
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of a parameter that cannot be hashed or compared structurally.
///
/// Equations carrying one are rejected when staged.
#[derive(Clone)]
pub struct Opaque {
    /// Description for error messages.
    pub name: String,
    /// The payload.
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.name)
    }
}

/// A primitive parameter value.
#[derive(Debug, Clone)]
pub enum Param {
    /// Integer.
    Int(i64),
    /// Float, hashed by bit pattern.
    Float(OrderedFloat<f64>),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
    /// Integer list.
    Ints(Vec<i64>),
    /// Element type.
    DType(DType),
    /// Sub-graph, for higher-order primitives.
    Graph(Arc<Graph>),
    /// Unhashable payload.
    Opaque(Opaque),
}

impl Param {
    /// False for parameters that cannot serve as cache keys.
    pub fn is_hashable(&self) -> bool {
        !matches!(self, Param::Opaque(_))
    }
}

impl PartialEq for Param {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Param::Int(a), Param::Int(b)) => a == b,
            (Param::Float(a), Param::Float(b)) => a == b,
            (Param::Bool(a), Param::Bool(b)) => a == b,
            (Param::Str(a), Param::Str(b)) => a == b,
            (Param::Ints(a), Param::Ints(b)) => a == b,
            (Param::DType(a), Param::DType(b)) => a == b,
            (Param::Graph(a), Param::Graph(b)) => Arc::ptr_eq(a, b) || a == b,
            (Param::Opaque(a), Param::Opaque(b)) => Arc::ptr_eq(&a.payload, &b.payload),
            _ => false,
        }
    }
}

impl Eq for Param {}

impl Hash for Param {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Param::Int(x) => x.hash(state),
            Param::Float(x) => x.hash(state),
            Param::Bool(x) => x.hash(state),
            Param::Str(x) => x.hash(state),
            Param::Ints(x) => x.hash(state),
            Param::DType(x) => x.hash(state),
            Param::Graph(g) => g.hash(state),
            Param::Opaque(o) => (Arc::as_ptr(&o.payload) as *const () as usize).hash(state),
        }
    }
}

/// Named parameters of an equation, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(BTreeMap<String, Param>);

impl Params {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: Param) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    /// Insert or replace a parameter.
    pub fn insert(&mut self, name: &str, value: Param) {
        self.0.insert(name.to_string(), value);
    }

    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.0.get(name)
    }

    /// Look up a sub-graph parameter.
    pub fn graph(&self, name: &str) -> Option<&Arc<Graph>> {
        match self.0.get(name) {
            Some(Param::Graph(g)) => Some(g),
            _ => None,
        }
    }

    /// Look up a string parameter.
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(Param::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Look up a dtype parameter.
    pub fn dtype(&self, name: &str) -> Option<DType> {
        match self.0.get(name) {
            Some(Param::DType(d)) => Some(*d),
            _ => None,
        }
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Name of the first parameter that cannot be hashed, if any.
    pub fn first_unhashable(&self) -> Option<&str> {
        self.iter().find(|(_, p)| !p.is_hashable()).map(|(k, _)| k)
    }
}

/// Provenance of an equation, carried through every transformation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SourceInfo {
    /// Free-form description such as the trace name that staged the equation.
    pub label: String,
}

impl SourceInfo {
    /// Provenance with the given label.
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

/// One primitive application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Equation {
    /// Operands.
    pub invars: Vec<Atom>,
    /// Results; drop placeholders for unused ones.
    pub outvars: Vec<Var>,
    /// Applied primitive.
    pub primitive: Primitive,
    /// Primitive parameters.
    pub params: Params,
    /// Effects, with input effects indexed into `invars`.
    pub effects: Effects,
    /// Provenance.
    pub source: SourceInfo,
}

impl Equation {
    /// Create an equation.
    pub fn new(
        invars: Vec<Atom>,
        outvars: Vec<Var>,
        primitive: Primitive,
        params: Params,
        effects: Effects,
        source: SourceInfo,
    ) -> Self {
        Self { invars, outvars, primitive, params, effects, source }
    }

    /// Same primitive and provenance with new binders, parameters and effects.
    pub fn rebuild(&self, invars: Vec<Atom>, outvars: Vec<Var>, params: Params, effects: Effects) -> Self {
        Self {
            invars,
            outvars,
            primitive: self.primitive.clone(),
            params,
            effects,
            source: self.source.clone(),
        }
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.outvars.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", v, v.aval())?;
        }
        write!(f, " = {}", self.primitive)?;
        let params: Vec<String> = self
            .params
            .iter()
            .filter(|(_, p)| !matches!(p, Param::Graph(_)))
            .map(|(k, p)| format!("{}={:?}", k, p))
            .collect();
        if !params.is_empty() {
            write!(f, "[{}]", params.join(", "))?;
        }
        for a in &self.invars {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

/// A traced computation.
///
/// Well-formed graphs bind every variable exactly once before it is read;
/// binders are constants, then inputs, then equation results in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Graph {
    /// Human-readable name for debugging
    pub name: String,
    /// Binders for values closed over by the graph.
    pub constvars: Vec<Var>,
    /// Input binders.
    pub invars: Vec<Var>,
    /// Outputs.
    pub outvars: Vec<Atom>,
    /// Equations in execution order.
    pub eqns: Vec<Equation>,
    /// Effects, with input effects indexed into `constvars ++ invars`.
    pub effects: Effects,
}

impl Graph {
    /// Build a graph, deriving its effect set from the equations.
    pub fn new(
        name: impl Into<String>,
        constvars: Vec<Var>,
        invars: Vec<Var>,
        outvars: Vec<Atom>,
        eqns: Vec<Equation>,
    ) -> Result<Self> {
        let effects = make_jaxpr_effects(&constvars, &invars, &eqns)?;
        Ok(Self { name: name.into(), constvars, invars, outvars, eqns, effects })
    }

    /// Input types.
    pub fn in_avals(&self) -> Vec<AbstractValue> {
        self.invars.iter().map(|v| v.aval().clone()).collect()
    }

    /// Output types.
    pub fn out_avals(&self) -> Vec<AbstractValue> {
        self.outvars.iter().map(|a| a.aval().clone()).collect()
    }

    /// Get the number of inputs.
    pub fn num_inputs(&self) -> usize {
        self.invars.len()
    }

    /// Get the number of outputs.
    pub fn num_outputs(&self) -> usize {
        self.outvars.len()
    }

    /// Constant and input binders, in the order input effects index them.
    pub fn binders(&self) -> Vec<Var> {
        self.constvars.iter().chain(self.invars.iter()).cloned().collect()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binders = |vs: &[Var]| {
            vs.iter().map(|v| format!("{}:{}", v, v.aval())).collect::<Vec<_>>().join(" ")
        };
        writeln!(f, "{{ lambda {} ; {}. let", binders(&self.constvars), binders(&self.invars))?;
        for eqn in &self.eqns {
            writeln!(f, "    {}", eqn)?;
        }
        let outs: Vec<String> = self.outvars.iter().map(|a| a.to_string()).collect();
        write!(f, "  in ({}) }}", outs.join(", "))
    }
}

/// Effect set of a graph assembled from its equations.
///
/// Input effects are re-indexed from each equation's operand list to the
/// position of the referenced variable in `constvars ++ invars`. Effects on
/// references allocated inside the graph are local and omitted.
pub fn make_jaxpr_effects(constvars: &[Var], invars: &[Var], eqns: &[Equation]) -> Result<Effects> {
    let binders: Vec<&Var> = constvars.iter().chain(invars.iter()).collect();
    let mut local_refs: HashSet<&Var> = HashSet::new();
    let mut effects = Effects::new();

    for eqn in eqns {
        for effect in &eqn.effects {
            let Some(index) = effect.input_index() else {
                if !matches!(effect, Effect::Alloc) {
                    effects.insert(effect.clone());
                }
                continue;
            };
            let atom = eqn.invars.get(index).ok_or_else(|| Error::InvalidInputEffect {
                primitive: eqn.primitive.clone(),
                index,
                num_inputs: eqn.invars.len(),
            })?;
            let var = match atom {
                Atom::Var(v) => v,
                Atom::Lit(_) => {
                    return Err(Error::UnboundInputEffect { primitive: eqn.primitive.clone(), index })
                }
            };
            if local_refs.contains(var) {
                continue;
            }
            let position = binders
                .iter()
                .position(|b| *b == var)
                .ok_or_else(|| Error::UnboundInputEffect { primitive: eqn.primitive.clone(), index })?;
            effects.insert(effect.with_input_index(position));
        }
        if eqn.primitive == Primitive::MutableArray {
            local_refs.extend(eqn.outvars.iter());
        }
    }
    Ok(effects)
}

/// Validate that every variable is bound exactly once before it is read.
///
/// Also checks input-effect indices and, recursively, sub-graph parameters.
pub fn check_jaxpr(graph: &Graph) -> Result<()> {
    let mut bound: HashSet<Var> = HashSet::new();
    let bind = |bound: &mut HashSet<Var>, v: &Var| -> Result<()> {
        for d in v.aval().dim_vars() {
            if !bound.contains(d) {
                return Err(Error::UnboundVar { var: d.to_string() });
            }
        }
        if v.is_dropped() {
            return Ok(());
        }
        if !bound.insert(v.clone()) {
            return Err(Error::InvalidGraph(format!("variable {} is bound twice in {}", v, graph.name)));
        }
        Ok(())
    };
    let read = |bound: &HashSet<Var>, atom: &Atom| -> Result<()> {
        for v in atom.vars() {
            if v.is_dropped() {
                return Err(Error::InvalidGraph(format!("drop placeholder read in {}", graph.name)));
            }
            if !bound.contains(&v) {
                return Err(Error::UnboundVar { var: v.to_string() });
            }
        }
        Ok(())
    };

    for v in graph.constvars.iter().chain(graph.invars.iter()) {
        bind(&mut bound, v)?;
    }
    for eqn in &graph.eqns {
        for atom in &eqn.invars {
            read(&bound, atom)?;
        }
        for effect in &eqn.effects {
            if let Some(index) = effect.input_index() {
                if index >= eqn.invars.len() {
                    return Err(Error::InvalidInputEffect {
                        primitive: eqn.primitive.clone(),
                        index,
                        num_inputs: eqn.invars.len(),
                    });
                }
            }
        }
        for (_, param) in eqn.params.iter() {
            if let Param::Graph(sub) = param {
                check_jaxpr(sub)?;
            }
        }
        for v in &eqn.outvars {
            bind(&mut bound, v)?;
        }
    }
    for atom in &graph.outvars {
        read(&bound, atom)?;
    }

    let derived = make_jaxpr_effects(&graph.constvars, &graph.invars, &graph.eqns)?;
    if !derived.is_subset(&graph.effects) {
        return Err(Error::InvalidGraph(format!(
            "effects {:?} of {} are not declared in {:?}",
            derived, graph.name, graph.effects
        )));
    }
    Ok(())
}

/// Turn constant binders into leading input binders.
pub fn convert_constvars_jaxpr(graph: &Graph) -> Graph {
    let mut invars = graph.constvars.clone();
    invars.extend(graph.invars.iter().cloned());
    Graph {
        name: graph.name.clone(),
        constvars: Vec::new(),
        invars,
        outvars: graph.outvars.clone(),
        eqns: graph.eqns.clone(),
        effects: graph.effects.clone(),
    }
}

/// Turn the first `n` input binders into constant binders.
pub fn convert_invars_to_constvars(graph: &Graph, n: usize) -> Result<Graph> {
    if !graph.constvars.is_empty() {
        return Err(Error::Unsupported(format!(
            "converting inputs of {} to constants when it already has constants",
            graph.name
        )));
    }
    if n > graph.invars.len() {
        return Err(Error::LengthMismatch {
            what: "inputs to convert to constants",
            expected: graph.invars.len(),
            actual: n,
        });
    }
    Ok(Graph {
        name: graph.name.clone(),
        constvars: graph.invars[..n].to_vec(),
        invars: graph.invars[n..].to_vec(),
        outvars: graph.outvars.clone(),
        eqns: graph.eqns.clone(),
        effects: graph.effects.clone(),
    })
}

fn reorder_invars(graph: &Graph, invars: Vec<Var>) -> Graph {
    let old = graph.binders();
    let mut new = graph.constvars.clone();
    new.extend(invars.iter().cloned());
    Graph {
        name: graph.name.clone(),
        constvars: graph.constvars.clone(),
        invars,
        outvars: graph.outvars.clone(),
        eqns: graph.eqns.clone(),
        effects: renumber_effects(&new, &old, &graph.effects),
    }
}

fn check_mask(what: &'static str, mask: &[bool], expected: usize) -> Result<()> {
    if mask.len() != expected {
        return Err(Error::LengthMismatch { what, expected, actual: mask.len() });
    }
    Ok(())
}

/// Move the selected input binders before the others, preserving relative order.
pub fn move_binders_to_front(graph: &Graph, to_move: &[bool]) -> Result<Graph> {
    check_mask("binders to move", to_move, graph.invars.len())?;
    let (moved, rest): (Vec<_>, Vec<_>) = graph.invars.iter().zip(to_move).partition(|(_, m)| **m);
    let invars = moved.into_iter().chain(rest).map(|(v, _)| v.clone()).collect();
    Ok(reorder_invars(graph, invars))
}

/// Move the selected input binders after the others, preserving relative order.
pub fn move_binders_to_back(graph: &Graph, to_move: &[bool]) -> Result<Graph> {
    let inverted: Vec<bool> = to_move.iter().map(|m| !m).collect();
    move_binders_to_front(graph, &inverted)
}

/// Keep only the outputs selected by `used_outputs`.
pub fn prune_jaxpr_outputs(graph: &Graph, used_outputs: &[bool]) -> Result<Graph> {
    check_mask("used outputs", used_outputs, graph.outvars.len())?;
    let outvars = graph
        .outvars
        .iter()
        .zip(used_outputs)
        .filter(|(_, used)| **used)
        .map(|(a, _)| a.clone())
        .collect();
    Ok(Graph { outvars, ..graph.clone() })
}
