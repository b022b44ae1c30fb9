//! Partial-evaluation tracing.
//!
//! A [`JaxprTrace`] runs a host function on [`Tracer`]s. Operations whose
//! operands are all known are evaluated immediately; everything else is
//! recorded as an equation recipe. Recipes hold their operands strongly and
//! their results weakly, so a recipe whose results are all dropped by the host
//! function is freed on the spot and never reaches the finished graph.
//! Effectful recipes are additionally pinned by the trace until it finishes.

use crate::trace::effects::{has_effects_for_partial_eval, has_input_effects, Effect, Effects};
use crate::trace::finalize::tracers_to_jaxpr;
use crate::trace::forwarding::forward_inputs;
use crate::trace::ir::convert_constvars_jaxpr;
use crate::trace::primitive::call_jaxpr;
use crate::trace::{
    AbstractValue, Atom, Equation, Graph, Literal, Param, Params, PartialVal, Primitive, Registry, SourceInfo, Var,
};
use crate::{Array, DType, Dim, Error, Result, Shape, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Global counter for generating unique trace IDs
static TRACE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Host function traced by [`JaxprTrace`].
pub type TracedFn<'a> = dyn Fn(&JaxprTrace, &[Tracer]) -> Result<Vec<Tracer>> + 'a;

pub(crate) struct TraceState {
    id: usize,
    name: String,
    registry: Arc<Registry>,
    eqn_counter: Cell<usize>,
    /// Effectful recipes that must survive even if their results are dropped.
    pub(crate) effect_handles: RefCell<Vec<Rc<EqnRecipe>>>,
    /// Tracers of enclosing traces already bound as free variables (node address -> tracer).
    free_vars: RefCell<HashMap<usize, Tracer>>,
    finished: Cell<bool>,
}

/// How a tracer's value is produced in the staged graph.
pub(crate) enum Recipe {
    /// Known value; no graph binding.
    Known,
    /// Graph input.
    LambdaBinding,
    /// Unknown value of an enclosing trace.
    FreeVar(Tracer),
    /// Known value instantiated as a graph constant.
    ConstVar(Value),
    /// Known scalar instantiated inline.
    Literal(Literal),
    /// Result of a staged equation.
    Eqn(Rc<EqnRecipe>),
}

pub(crate) struct EqnRecipe {
    pub(crate) eqn_id: usize,
    pub(crate) in_tracers: Vec<Tracer>,
    pub(crate) out_tracers: RefCell<Vec<Weak<TracerNode>>>,
    pub(crate) out_avals: Vec<AbstractValue>,
    pub(crate) primitive: Primitive,
    pub(crate) params: Params,
    pub(crate) effects: Effects,
    pub(crate) source: SourceInfo,
}

pub(crate) struct TracerNode {
    trace: Weak<TraceState>,
    trace_id: usize,
    pub(crate) pval: PartialVal,
    /// Graph variable; present exactly when the value is unknown.
    pub(crate) var: Option<Var>,
    pub(crate) recipe: Recipe,
    /// Tracers holding the sizes of dynamic dimensions.
    pub(crate) dim_parents: Vec<Tracer>,
    provenance: String,
}

/// A value flowing through a [`JaxprTrace`].
#[derive(Clone)]
pub struct Tracer(pub(crate) Rc<TracerNode>);

impl Tracer {
    /// The partial value carried by this tracer.
    pub fn pval(&self) -> &PartialVal {
        &self.0.pval
    }

    /// Abstract type of the value.
    pub fn aval(&self) -> AbstractValue {
        self.0.pval.get_aval()
    }

    /// Returns true if the value is available now.
    pub fn is_known(&self) -> bool {
        self.0.pval.is_known()
    }

    /// The known value, if any.
    pub fn known_value(&self) -> Option<&Value> {
        self.0.pval.get_known()
    }

    /// Description of the operation that created this tracer.
    pub fn provenance(&self) -> &str {
        &self.0.provenance
    }

    pub(crate) fn node_id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub(crate) fn var(&self) -> Option<&Var> {
        self.0.var.as_ref()
    }

    /// Tracers that must be bound before this one.
    pub(crate) fn parents(&self) -> Vec<Tracer> {
        let mut parents = match &self.0.recipe {
            Recipe::Eqn(recipe) => recipe.in_tracers.clone(),
            _ => Vec::new(),
        };
        parents.extend(self.0.dim_parents.iter().cloned());
        parents
    }

    /// Operand form of an instantiated tracer inside its own trace.
    fn atom(&self) -> Option<Atom> {
        match &self.0.recipe {
            Recipe::Literal(lit) => Some(Atom::Lit(lit.clone())),
            _ => self.0.var.clone().map(Atom::Var),
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.pval {
            PartialVal::Known(v) => write!(f, "Tracer(known {:?})", v),
            PartialVal::Unknown(aval) => write!(f, "Tracer(unknown {} from {})", aval, self.0.provenance),
        }
    }
}

/// A dimension given to [`JaxprTrace::new_dynamic_arg`].
#[derive(Debug, Clone)]
pub enum DimSpec {
    /// Size known while tracing.
    Static(usize),
    /// Size held by a scalar integer tracer.
    Of(Tracer),
}

/// Result of tracing a host function with partially known inputs.
#[derive(Debug, Clone)]
pub struct TracedJaxpr {
    /// Staged computation of the unknown outputs from the unknown inputs.
    pub jaxpr: Graph,
    /// One per output: known value or abstract value of a staged output.
    pub out_pvals: Vec<PartialVal>,
    /// Values for `jaxpr.constvars`.
    pub consts: Vec<Value>,
}

pub(crate) struct SubTrace {
    pub(crate) jaxpr: Graph,
    pub(crate) out_pvals: Vec<PartialVal>,
    pub(crate) consts: Vec<Value>,
    pub(crate) env: Vec<Tracer>,
}

/// A partial-evaluation trace.
///
/// Host code receives a `&JaxprTrace` and builds on tracers with
/// [`bind`](JaxprTrace::bind) or the operation helpers.
pub struct JaxprTrace {
    state: Rc<TraceState>,
}

impl JaxprTrace {
    /// Create a trace that resolves primitives through `registry`.
    pub fn new(name: impl Into<String>, registry: Arc<Registry>) -> Self {
        let state = TraceState {
            id: TRACE_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            registry,
            eqn_counter: Cell::new(0),
            effect_handles: RefCell::new(Vec::new()),
            free_vars: RefCell::new(HashMap::new()),
            finished: Cell::new(false),
        };
        Self { state: Rc::new(state) }
    }

    /// Name used in provenance and graph names.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Registry the trace resolves primitives through.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.state.registry
    }

    pub(crate) fn effect_handles(&self) -> Vec<Rc<EqnRecipe>> {
        self.state.effect_handles.borrow().clone()
    }

    fn next_eqn_id(&self) -> usize {
        let id = self.state.eqn_counter.get();
        self.state.eqn_counter.set(id + 1);
        id
    }

    fn new_tracer(&self, pval: PartialVal, recipe: Recipe, dim_parents: Vec<Tracer>, provenance: String) -> Tracer {
        let var = match &pval {
            PartialVal::Known(_) => None,
            PartialVal::Unknown(aval) => Some(Var::new(aval.clone())),
        };
        Tracer(Rc::new(TracerNode {
            trace: Rc::downgrade(&self.state),
            trace_id: self.state.id,
            pval,
            var,
            recipe,
            dim_parents,
            provenance,
        }))
    }

    /// Tracer for a graph input, or a known constant if `pval` is known.
    pub fn new_arg(&self, pval: PartialVal) -> Tracer {
        match pval {
            PartialVal::Known(value) => self.new_const(value),
            unknown => {
                let provenance = format!("argument of trace `{}`", self.name());
                self.new_tracer(unknown, Recipe::LambdaBinding, Vec::new(), provenance)
            }
        }
    }

    /// Graph input whose dimensions may be held by other tracers.
    ///
    /// Known sizes become static dimensions; unknown ones become dynamic
    /// dimensions referring to the size tracer's variable.
    pub fn new_dynamic_arg(&self, dtype: DType, dims: &[DimSpec]) -> Result<Tracer> {
        let mut shape = Vec::with_capacity(dims.len());
        let mut dim_parents = Vec::new();
        for spec in dims {
            match spec {
                DimSpec::Static(n) => shape.push(Dim::Static(*n)),
                DimSpec::Of(t) => {
                    let t = self.to_jaxpr_tracer(t)?;
                    if let Some(value) = t.known_value() {
                        let size = value.as_array().and_then(Array::item).ok_or_else(|| {
                            Error::Unsupported("dimension sizes must be scalar arrays".into())
                        })?;
                        shape.push(Dim::Static(size as usize));
                    } else {
                        let aval = t.aval();
                        if !aval.is_scalar() || !aval.dtype().is_int() {
                            return Err(Error::Unsupported(format!("dimension size of type {}", aval)));
                        }
                        let var = t.var().cloned().ok_or_else(|| Error::Unsupported("uninstantiated dimension".into()))?;
                        shape.push(Dim::Dynamic(var));
                        dim_parents.push(t);
                    }
                }
            }
        }
        let aval = AbstractValue::array(Shape::from_dims(shape), dtype);
        let provenance = format!("dynamic argument of trace `{}`", self.name());
        Ok(self.new_tracer(PartialVal::Unknown(aval), Recipe::LambdaBinding, dim_parents, provenance))
    }

    /// Known tracer holding `value`.
    pub fn new_const(&self, value: impl Into<Value>) -> Tracer {
        let provenance = format!("constant in trace `{}`", self.name());
        self.new_tracer(PartialVal::Known(value.into()), Recipe::Known, Vec::new(), provenance)
    }

    fn new_instantiated_literal(&self, array: Array) -> Tracer {
        let aval = AbstractValue::of_array(&array);
        let provenance = format!("literal in trace `{}`", self.name());
        self.new_tracer(PartialVal::Unknown(aval), Recipe::Literal(Literal::new(array)), Vec::new(), provenance)
    }

    fn new_instantiated_const(&self, value: Value) -> Tracer {
        let aval = AbstractValue::of(&value);
        let provenance = format!("constant in trace `{}`", self.name());
        self.new_tracer(PartialVal::Unknown(aval), Recipe::ConstVar(value), Vec::new(), provenance)
    }

    /// Turn a known tracer into an unknown one bound to its value.
    ///
    /// Rank-0 arrays become inline literals; other values become graph
    /// constants. Unknown tracers are returned unchanged.
    pub fn instantiate_const(&self, tracer: &Tracer) -> Tracer {
        match tracer.known_value() {
            None => tracer.clone(),
            Some(Value::Array(a)) if Literal::is_literalable(a) => self.new_instantiated_literal(a.clone()),
            Some(value) => self.new_instantiated_const(value.clone()),
        }
    }

    /// Bring a tracer into this trace.
    ///
    /// Tracers of another live trace become free variables (or constants if
    /// known). Tracers of a finished trace are rejected as escaped.
    pub fn to_jaxpr_tracer(&self, tracer: &Tracer) -> Result<Tracer> {
        if tracer.0.trace_id == self.state.id {
            return Ok(tracer.clone());
        }
        let owner = tracer.0.trace.upgrade();
        if owner.map_or(true, |t| t.finished.get()) {
            return Err(Error::EscapedTracer { provenance: tracer.provenance().to_string() });
        }
        if let Some(value) = tracer.known_value() {
            return Ok(self.new_const(value.clone()));
        }
        let key = tracer.node_id();
        if let Some(bound) = self.state.free_vars.borrow().get(&key) {
            return Ok(bound.clone());
        }
        let provenance = format!("free variable of trace `{}`", self.name());
        let free = self.new_tracer(tracer.0.pval.clone(), Recipe::FreeVar(tracer.clone()), Vec::new(), provenance);
        self.state.free_vars.borrow_mut().insert(key, free.clone());
        Ok(free)
    }

    /// Apply a primitive to tracers.
    pub fn bind(&self, prim: Primitive, operands: &[Tracer], params: Params) -> Result<Vec<Tracer>> {
        if prim == Primitive::Call {
            let graph = call_jaxpr(&prim, &params)?.clone();
            if !graph.constvars.is_empty() {
                return Err(Error::Unsupported(format!("call of {} with unbound constants", graph.name)));
            }
            return self.process_call(&|t, args| t.eval_graph(&graph, &[], args), operands, params);
        }
        self.default_process_primitive(prim, operands, params)
    }

    /// Apply a single-result primitive to tracers.
    pub fn bind1(&self, prim: Primitive, operands: &[Tracer], params: Params) -> Result<Tracer> {
        let mut outs = self.bind(prim.clone(), operands, params)?;
        if outs.len() != 1 {
            return Err(Error::ArityMismatch { primitive: prim, expected: 1, actual: outs.len() });
        }
        Ok(outs.remove(0))
    }

    fn default_process_primitive(&self, prim: Primitive, operands: &[Tracer], params: Params) -> Result<Vec<Tracer>> {
        let tracers = operands.iter().map(|t| self.to_jaxpr_tracer(t)).collect::<Result<Vec<_>>>()?;
        let registry = self.state.registry.clone();
        let effectful = registry.is_effectful(&prim, &params)?;

        let avals: Vec<AbstractValue> = tracers.iter().map(Tracer::aval).collect();
        if !effectful && tracers.iter().all(Tracer::is_known) {
            // Operand types are checked before any data is touched.
            registry.abstract_eval(&prim, &avals, &params)?;
            let args: Vec<Value> = tracers.iter().filter_map(|t| t.known_value().cloned()).collect();
            let outs = registry.eval(&prim, &args, &params)?;
            return Ok(outs.into_iter().map(|v| self.new_const(v)).collect());
        }

        if !effectful && registry.config().eager_constant_folding && tracers.iter().any(Tracer::is_known) {
            if let Some(rule) = registry.const_fold_rule(&prim) {
                let (out_avals, _) = registry.abstract_eval(&prim, &avals, &params)?;
                let consts: Vec<Option<&Value>> = tracers.iter().map(Tracer::known_value).collect();
                if let Some(values) = rule(&consts, &params, &out_avals) {
                    log::trace!("folded {} with partially known operands", prim);
                    return Ok(values.into_iter().map(|v| self.new_const(v)).collect());
                }
            }
        }

        if let Some(param) = params.first_unhashable() {
            return Err(Error::UnhashableParam { primitive: prim, param: param.to_string() });
        }

        let operands = tracers;
        let tracers: Vec<Tracer> = operands.iter().map(|t| self.instantiate_const(t)).collect();
        let (out_avals, effects) = registry.abstract_eval(&prim, &avals, &params)?;

        let fwds = if has_input_effects(&effects) {
            None
        } else {
            let candidate = Equation::new(
                tracers.iter().filter_map(Tracer::atom).collect(),
                out_avals.iter().map(|a| Var::new(a.clone())).collect(),
                prim.clone(),
                params.clone(),
                effects.clone(),
                SourceInfo::default(),
            );
            forward_inputs(&registry, &candidate)
        };
        let pinned = effects.iter().any(Effect::pins_equation);
        if let Some(fwds) = &fwds {
            if !pinned && fwds.iter().all(Option::is_some) {
                log::trace!("forwarded every output of {}", prim);
                return Ok(fwds.iter().flatten().map(|&i| operands[i].clone()).collect());
            }
        }

        let outs = self.new_eqn_recipe(tracers, out_avals, prim, params, effects);
        Ok(match fwds {
            Some(fwds) => outs
                .into_iter()
                .zip(fwds)
                .map(|(out, fwd)| fwd.map_or(out, |i| operands[i].clone()))
                .collect(),
            None => outs,
        })
    }

    fn new_eqn_recipe(
        &self,
        in_tracers: Vec<Tracer>,
        out_avals: Vec<AbstractValue>,
        primitive: Primitive,
        params: Params,
        effects: Effects,
    ) -> Vec<Tracer> {
        let recipe = Rc::new(EqnRecipe {
            eqn_id: self.next_eqn_id(),
            in_tracers,
            out_tracers: RefCell::new(Vec::new()),
            out_avals: out_avals.clone(),
            source: SourceInfo::new(format!("{}:{}", self.name(), primitive)),
            primitive,
            params,
            effects,
        });
        let provenance = format!("{} in trace `{}`", recipe.primitive, self.name());
        let outs: Vec<Tracer> = out_avals
            .into_iter()
            .map(|aval| self.new_tracer(PartialVal::Unknown(aval), Recipe::Eqn(recipe.clone()), Vec::new(), provenance.clone()))
            .collect();
        *recipe.out_tracers.borrow_mut() = outs.iter().map(|t| Rc::downgrade(&t.0)).collect();
        if recipe.effects.iter().any(Effect::pins_equation) {
            self.state.effect_handles.borrow_mut().push(recipe);
        }
        outs
    }

    /// Trace `f` as a call: known work happens now, the rest is staged as a
    /// single call equation over residuals, free variables and unknown operands.
    pub fn call(&self, name: &str, f: &TracedFn<'_>, operands: &[Tracer]) -> Result<Vec<Tracer>> {
        self.process_call(f, operands, Params::new().with("name", Param::Str(name.to_string())))
    }

    fn process_call(&self, f: &TracedFn<'_>, operands: &[Tracer], params: Params) -> Result<Vec<Tracer>> {
        let tracers = operands.iter().map(|t| self.to_jaxpr_tracer(t)).collect::<Result<Vec<_>>>()?;
        let in_pvals: Vec<PartialVal> = tracers.iter().map(|t| t.pval().clone()).collect();
        let label = params.str("name").unwrap_or("call").to_string();
        let sub = JaxprTrace::new(format!("{}/{}", self.name(), label), self.state.registry.clone());
        let traced = trace_to_subjaxpr_nounits(&sub, f, &in_pvals, Instantiate::Nothing)?;
        drop(sub);

        let staged = convert_constvars_jaxpr(&traced.jaxpr);
        let unknown_avals: Vec<AbstractValue> = traced
            .out_pvals
            .iter()
            .filter(|pv| !pv.is_known())
            .map(PartialVal::get_aval)
            .collect();

        let staged_outs = if unknown_avals.is_empty() && !has_effects_for_partial_eval(&staged.effects) {
            Vec::new()
        } else {
            let mut in_tracers: Vec<Tracer> =
                traced.consts.iter().map(|c| self.instantiate_const(&self.new_const(c.clone()))).collect();
            for t in &traced.env {
                in_tracers.push(self.to_jaxpr_tracer(t)?);
            }
            in_tracers.extend(tracers.iter().filter(|t| !t.is_known()).cloned());
            let effects = staged.effects.clone();
            let mut params = params;
            params.insert("call_jaxpr", Param::Graph(Arc::new(staged)));
            self.new_eqn_recipe(in_tracers, unknown_avals, Primitive::Call, params, effects)
        };

        let mut staged_outs = staged_outs.into_iter();
        traced
            .out_pvals
            .into_iter()
            .map(|pv| match pv {
                PartialVal::Known(v) => Ok(self.new_const(v)),
                PartialVal::Unknown(_) => staged_outs.next().ok_or_else(|| {
                    Error::InvalidGraph("staged call produced fewer results than unknown outputs".into())
                }),
            })
            .collect()
    }

    /// Replay `graph` on tracers of this trace.
    pub fn eval_graph(&self, graph: &Graph, consts: &[Value], args: &[Tracer]) -> Result<Vec<Tracer>> {
        if graph.constvars.len() != consts.len() {
            return Err(Error::LengthMismatch {
                what: "graph constants",
                expected: graph.constvars.len(),
                actual: consts.len(),
            });
        }
        if graph.invars.len() != args.len() {
            return Err(Error::LengthMismatch { what: "graph arguments", expected: graph.invars.len(), actual: args.len() });
        }
        let mut env: HashMap<Var, Tracer> = HashMap::new();
        for (v, c) in graph.constvars.iter().zip(consts) {
            env.insert(v.clone(), self.new_const(c.clone()));
        }
        for (v, t) in graph.invars.iter().zip(args) {
            env.insert(v.clone(), t.clone());
        }
        let read = |env: &HashMap<Var, Tracer>, atom: &Atom| -> Result<Tracer> {
            match atom {
                Atom::Lit(lit) => Ok(self.new_const(lit.value.clone())),
                Atom::Var(v) => env.get(v).cloned().ok_or_else(|| Error::UnboundVar { var: v.to_string() }),
            }
        };
        for eqn in &graph.eqns {
            let ins = eqn.invars.iter().map(|a| read(&env, a)).collect::<Result<Vec<_>>>()?;
            let outs = self.bind(eqn.primitive.clone(), &ins, eqn.params.clone())?;
            if outs.len() != eqn.outvars.len() {
                return Err(Error::ArityMismatch {
                    primitive: eqn.primitive.clone(),
                    expected: eqn.outvars.len(),
                    actual: outs.len(),
                });
            }
            for (v, t) in eqn.outvars.iter().zip(outs) {
                if !v.is_dropped() {
                    env.insert(v.clone(), t);
                }
            }
        }
        graph.outvars.iter().map(|a| read(&env, a)).collect()
    }

    fn finish(&self) {
        self.state.finished.set(true);
        self.state.effect_handles.borrow_mut().clear();
        self.state.free_vars.borrow_mut().clear();
    }

    // -----------------------------------------------------------------------
    // Operation helpers
    // -----------------------------------------------------------------------

    /// Apply a unary primitive.
    pub fn unary(&self, prim: Primitive, x: &Tracer) -> Result<Tracer> {
        self.bind1(prim, std::slice::from_ref(x), Params::new())
    }

    /// Apply a binary primitive.
    pub fn binary(&self, prim: Primitive, x: &Tracer, y: &Tracer) -> Result<Tracer> {
        self.bind1(prim, &[x.clone(), y.clone()], Params::new())
    }

    /// `-x`
    pub fn neg(&self, x: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::Neg, x)
    }

    /// `sin(x)`
    pub fn sin(&self, x: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::Sin, x)
    }

    /// `cos(x)`
    pub fn cos(&self, x: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::Cos, x)
    }

    /// `exp(x)`
    pub fn exp(&self, x: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::Exp, x)
    }

    /// `tanh(x)`
    pub fn tanh(&self, x: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::Tanh, x)
    }

    /// `x + y`
    pub fn add(&self, x: &Tracer, y: &Tracer) -> Result<Tracer> {
        self.binary(Primitive::Add, x, y)
    }

    /// `x - y`
    pub fn sub(&self, x: &Tracer, y: &Tracer) -> Result<Tracer> {
        self.binary(Primitive::Sub, x, y)
    }

    /// `x * y`
    pub fn mul(&self, x: &Tracer, y: &Tracer) -> Result<Tracer> {
        self.binary(Primitive::Mul, x, y)
    }

    /// Vector or matrix product.
    pub fn dot(&self, x: &Tracer, y: &Tracer) -> Result<Tracer> {
        self.binary(Primitive::Dot, x, y)
    }

    /// Sum of all elements.
    pub fn reduce_sum(&self, x: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::ReduceSum, x)
    }

    /// `pred ? on_true : on_false`, elementwise.
    pub fn select(&self, pred: &Tracer, on_true: &Tracer, on_false: &Tracer) -> Result<Tracer> {
        self.bind1(Primitive::Select, &[pred.clone(), on_true.clone(), on_false.clone()], Params::new())
    }

    /// Cast to `dtype`.
    pub fn convert_element_type(&self, x: &Tracer, dtype: DType) -> Result<Tracer> {
        self.bind1(Primitive::ConvertElementType, std::slice::from_ref(x), Params::new().with("new_dtype", Param::DType(dtype)))
    }

    /// Log values when the staged graph runs.
    pub fn debug_print(&self, fmt: &str, xs: &[Tracer]) -> Result<()> {
        self.bind(Primitive::DebugPrint, xs, Params::new().with("fmt", Param::Str(fmt.to_string())))?;
        Ok(())
    }

    /// Allocate a mutable reference initialized to `init`.
    pub fn mutable_array(&self, init: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::MutableArray, init)
    }

    /// Read a reference.
    pub fn ref_get(&self, cell: &Tracer) -> Result<Tracer> {
        self.unary(Primitive::RefGet, cell)
    }

    /// Write a reference.
    pub fn ref_set(&self, cell: &Tracer, value: &Tracer) -> Result<()> {
        self.bind(Primitive::RefSet, &[cell.clone(), value.clone()], Params::new())?;
        Ok(())
    }
}

impl fmt::Debug for JaxprTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JaxprTrace").field("name", &self.state.name).field("id", &self.state.id).finish()
    }
}

/// Which outputs of a traced function are forced into the staged graph.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Instantiate<'a> {
    Nothing,
    All,
    Mask(&'a [bool]),
}

pub(crate) fn trace_to_subjaxpr_nounits(
    trace: &JaxprTrace,
    f: &TracedFn<'_>,
    in_pvals: &[PartialVal],
    instantiate: Instantiate<'_>,
) -> Result<SubTrace> {
    let in_tracers: Vec<Tracer> = in_pvals.iter().map(|pv| trace.new_arg(pv.clone())).collect();
    let outs = f(trace, &in_tracers)?;
    let mask = match instantiate {
        Instantiate::Nothing => vec![false; outs.len()],
        Instantiate::All => vec![true; outs.len()],
        Instantiate::Mask(mask) if mask.len() == outs.len() => mask.to_vec(),
        Instantiate::Mask(mask) => {
            return Err(Error::LengthMismatch { what: "instantiate mask", expected: outs.len(), actual: mask.len() })
        }
    };
    let outs: Vec<Tracer> = outs
        .iter()
        .zip(mask)
        .map(|(t, inst)| {
            let t = trace.to_jaxpr_tracer(t)?;
            Ok(if inst { trace.instantiate_const(&t) } else { t })
        })
        .collect::<Result<_>>()?;
    let out_pvals: Vec<PartialVal> = outs.iter().map(|t| t.pval().clone()).collect();

    let lambda_tracers: Vec<Tracer> = in_tracers.into_iter().filter(|t| !t.is_known()).collect();
    let unknown_outs: Vec<Tracer> = outs.into_iter().filter(|t| !t.is_known()).collect();
    let finished = tracers_to_jaxpr(trace, &lambda_tracers, &unknown_outs);
    trace.finish();
    let (jaxpr, consts, env) = finished?;
    Ok(SubTrace { jaxpr, out_pvals, consts, env })
}

/// Trace `f` with partially known inputs.
///
/// Known work is performed eagerly; the returned graph computes the unknown
/// outputs from the unknown inputs. `instantiate` forces known outputs to be
/// staged as well.
pub fn trace_to_jaxpr_nounits(
    registry: &Arc<Registry>,
    name: &str,
    f: &TracedFn<'_>,
    in_pvals: &[PartialVal],
    instantiate: &[bool],
) -> Result<TracedJaxpr> {
    trace_to_jaxpr(registry, name, f, in_pvals, Instantiate::Mask(instantiate))
}

fn trace_to_jaxpr(
    registry: &Arc<Registry>,
    name: &str,
    f: &TracedFn<'_>,
    in_pvals: &[PartialVal],
    instantiate: Instantiate<'_>,
) -> Result<TracedJaxpr> {
    let trace = JaxprTrace::new(name, registry.clone());
    let sub = trace_to_subjaxpr_nounits(&trace, f, in_pvals, instantiate)?;
    if let Some(free) = sub.env.first() {
        return Err(Error::EscapedTracer { provenance: free.provenance().to_string() });
    }
    log::debug!(
        "traced `{}`: {} staged equation(s), {} known output(s)",
        name,
        sub.jaxpr.eqns.len(),
        sub.out_pvals.iter().filter(|pv| pv.is_known()).count()
    );
    Ok(TracedJaxpr { jaxpr: sub.jaxpr, out_pvals: sub.out_pvals, consts: sub.consts })
}

/// Stage all of `f` into a graph over inputs of the given types.
///
/// Every output is instantiated, so the graph computes all of them.
pub fn make_jaxpr(registry: &Arc<Registry>, name: &str, f: &TracedFn<'_>, in_avals: &[AbstractValue]) -> Result<TracedJaxpr> {
    let in_pvals: Vec<PartialVal> = in_avals.iter().cloned().map(PartialVal::Unknown).collect();
    trace_to_jaxpr(registry, name, f, &in_pvals, Instantiate::All)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::eval_jaxpr;
    use crate::Config;
    use approx::assert_relative_eq;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(Config { enable_checks: true, ..Config::default() }))
    }

    fn vec_aval(n: usize) -> AbstractValue {
        AbstractValue::array(vec![n], DType::Float32)
    }

    #[test]
    fn test_all_known_is_evaluated_eagerly() {
        let reg = registry();
        let x = Array::from_vec(vec![0.0, 1.0], vec![2]);
        let traced = trace_to_jaxpr_nounits(&reg, "f", &|t, xs| Ok(vec![t.sin(&xs[0])?]), &[PartialVal::known(x)], &[false])
            .unwrap();
        assert!(traced.jaxpr.eqns.is_empty());
        let out = traced.out_pvals[0].get_known().unwrap().as_array().unwrap().to_vec();
        assert_relative_eq!(out[1], 1.0f32.sin());
    }

    #[test]
    fn test_known_operands_are_type_checked() {
        let reg = registry();
        let pred = Array::from_vec_typed(vec![1.0, 0.0], vec![2], DType::Bool);
        let on_true = Array::from_vec(vec![1.0, 2.0, 3.0], vec![3]);
        let on_false = Array::from_vec(vec![4.0, 5.0, 6.0], vec![3]);
        let err = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| Ok(vec![t.select(&xs[0], &xs[1], &xs[2])?]),
            &[PartialVal::known(pred), PartialVal::known(on_true), PartialVal::known(on_false)],
            &[false],
        )
        .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { primitive: Primitive::Select, .. }), "{}", err);
    }

    #[test]
    fn test_mixed_known_unknown() {
        let reg = registry();
        let a = Array::from_vec(vec![0.5, 1.5], vec![2]);
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| {
                let c = t.cos(&xs[0])?;
                let d = t.sin(&xs[0])?;
                let e = t.neg(&d)?;
                let f = t.mul(&e, &xs[1])?;
                Ok(vec![c, f])
            },
            &[PartialVal::known(a.clone()), PartialVal::unknown(vec_aval(2))],
            &[false, false],
        )
        .unwrap();

        assert!(traced.out_pvals[0].is_known());
        assert!(!traced.out_pvals[1].is_known());
        assert_eq!(traced.jaxpr.eqns.len(), 1);
        assert_eq!(traced.jaxpr.eqns[0].primitive, Primitive::Mul);
        assert_eq!(traced.jaxpr.constvars.len(), 1);
        assert_eq!(traced.consts.len(), 1);

        let b = Value::from(Array::from_vec(vec![2.0, 3.0], vec![2]));
        let out = eval_jaxpr(&reg, &traced.jaxpr, &traced.consts, &[b]).unwrap();
        let data = out[0].as_array().unwrap().to_vec();
        assert_relative_eq!(data[0], -(0.5f32.sin()) * 2.0, epsilon = 1e-6);
        assert_relative_eq!(data[1], -(1.5f32.sin()) * 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_scalar_constants_become_literals() {
        let reg = registry();
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| Ok(vec![t.mul(&xs[0], &xs[1])?]),
            &[PartialVal::known(Array::scalar(3.0, DType::Float32)), PartialVal::unknown(AbstractValue::scalar(DType::Float32))],
            &[false],
        )
        .unwrap();
        assert!(traced.jaxpr.constvars.is_empty());
        assert!(matches!(traced.jaxpr.eqns[0].invars[0], Atom::Lit(_)));
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let reg = registry();
        let c = Array::from_vec(vec![1.0, 2.0], vec![2]);
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| {
                let y = t.add(&xs[0], &xs[1])?;
                let z = t.mul(&xs[0], &y)?;
                Ok(vec![z])
            },
            &[PartialVal::known(c), PartialVal::unknown(vec_aval(2))],
            &[false],
        )
        .unwrap();
        assert_eq!(traced.jaxpr.constvars.len(), 1);
        assert_eq!(traced.consts.len(), 1);
    }

    #[test]
    fn test_dropped_results_are_not_staged() {
        let reg = registry();
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| {
                let _unused = t.exp(&xs[0])?;
                Ok(vec![t.sin(&xs[0])?])
            },
            &[PartialVal::unknown(vec_aval(3))],
            &[false],
        )
        .unwrap();
        assert_eq!(traced.jaxpr.eqns.len(), 1);
        assert_eq!(traced.jaxpr.eqns[0].primitive, Primitive::Sin);
    }

    #[test]
    fn test_effectful_equations_are_kept() {
        let reg = registry();
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| {
                t.debug_print("x", &xs[..1])?;
                Ok(vec![t.cos(&xs[0])?])
            },
            &[PartialVal::known(Array::from_vec(vec![1.0], vec![1]))],
            &[false],
        )
        .unwrap();
        assert_eq!(traced.jaxpr.eqns.len(), 1);
        assert_eq!(traced.jaxpr.eqns[0].primitive, Primitive::DebugPrint);
        assert!(traced.jaxpr.effects.contains(&Effect::Ordered("debug".into())));
        assert!(traced.out_pvals[0].is_known());
    }

    #[test]
    fn test_instantiate_forces_staging() {
        let reg = registry();
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| Ok(vec![t.neg(&xs[0])?]),
            &[PartialVal::known(Array::from_vec(vec![1.0, 2.0], vec![2]))],
            &[true],
        )
        .unwrap();
        assert!(!traced.out_pvals[0].is_known());
        assert_eq!(traced.jaxpr.outvars.len(), 1);
        let out = eval_jaxpr(&reg, &traced.jaxpr, &traced.consts, &[]).unwrap();
        assert_eq!(out[0].as_array().unwrap().to_vec(), vec![-1.0, -2.0]);
    }

    #[test]
    fn test_escaped_tracer_is_rejected() {
        let reg = registry();
        let leaked: RefCell<Option<Tracer>> = RefCell::new(None);
        trace_to_jaxpr_nounits(
            &reg,
            "first",
            &|t, xs| {
                let y = t.sin(&xs[0])?;
                *leaked.borrow_mut() = Some(y.clone());
                Ok(vec![y])
            },
            &[PartialVal::unknown(vec_aval(2))],
            &[false],
        )
        .unwrap();

        let stale = leaked.borrow().clone().unwrap();
        let err = trace_to_jaxpr_nounits(
            &reg,
            "second",
            &|t, xs| Ok(vec![t.add(&xs[0], &stale)?]),
            &[PartialVal::unknown(vec_aval(2))],
            &[false],
        )
        .unwrap_err();
        assert!(matches!(err, Error::EscapedTracer { .. }));
    }

    #[test]
    fn test_unhashable_params_are_rejected() {
        use crate::trace::Opaque;
        let reg = registry();
        let err = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| {
                let params = Params::new().with("hook", Param::Opaque(Opaque { name: "hook".into(), payload: Arc::new(()) }));
                Ok(vec![t.bind1(Primitive::Sin, &xs[..1], params)?])
            },
            &[PartialVal::unknown(vec_aval(2))],
            &[false],
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnhashableParam { .. }));
    }

    #[test]
    fn test_call_splits_known_and_unknown_work() {
        let reg = registry();
        let a = Array::from_vec(vec![0.25, 0.75], vec![2]);
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "outer",
            &|t, xs| {
                t.call(
                    "inner",
                    &|t, ys| {
                        let s = t.sin(&ys[0])?;
                        Ok(vec![s.clone(), t.mul(&s, &ys[1])?])
                    },
                    xs,
                )
            },
            &[PartialVal::known(a.clone()), PartialVal::unknown(vec_aval(2))],
            &[false, false],
        )
        .unwrap();

        assert!(traced.out_pvals[0].is_known());
        assert_eq!(traced.jaxpr.eqns.len(), 1);
        let call = &traced.jaxpr.eqns[0];
        assert_eq!(call.primitive, Primitive::Call);
        let body = call.params.graph("call_jaxpr").unwrap();
        assert_eq!(body.eqns.len(), 1);
        assert_eq!(body.eqns[0].primitive, Primitive::Mul);

        let b = Value::from(Array::from_vec(vec![2.0, 4.0], vec![2]));
        let out = eval_jaxpr(&reg, &traced.jaxpr, &traced.consts, &[b]).unwrap();
        let data = out[0].as_array().unwrap().to_vec();
        assert_relative_eq!(data[0], 0.25f32.sin() * 2.0, epsilon = 1e-6);
        assert_relative_eq!(data[1], 0.75f32.sin() * 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_call_closes_over_outer_tracers() {
        let reg = registry();
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "outer",
            &|t, xs| {
                let captured = t.exp(&xs[0])?;
                t.call("inner", &|t, ys| Ok(vec![t.add(&ys[0], &captured)?]), &xs[1..])
            },
            &[PartialVal::unknown(vec_aval(2)), PartialVal::unknown(vec_aval(2))],
            &[false],
        )
        .unwrap();
        assert_eq!(traced.jaxpr.eqns.len(), 2);
        let call = &traced.jaxpr.eqns[1];
        assert_eq!(call.invars.len(), 2);
        assert_eq!(call.invars[0], Atom::Var(traced.jaxpr.eqns[0].outvars[0].clone()));

        let x = Value::from(Array::from_vec(vec![0.0, 1.0], vec![2]));
        let y = Value::from(Array::from_vec(vec![1.0, 1.0], vec![2]));
        let out = eval_jaxpr(&reg, &traced.jaxpr, &[], &[x, y]).unwrap();
        let data = out[0].as_array().unwrap().to_vec();
        assert_relative_eq!(data[0], 2.0);
        assert_relative_eq!(data[1], 1.0 + 1.0f32.exp(), epsilon = 1e-5);
    }

    #[test]
    fn test_dynamic_dims_reference_size_inputs() {
        let reg = registry();
        let trace = JaxprTrace::new("dyn", reg.clone());
        let n = trace.new_arg(PartialVal::unknown(AbstractValue::scalar(DType::Int32)));
        let x = trace.new_dynamic_arg(DType::Float32, &[DimSpec::Of(n.clone()), DimSpec::Static(3)]).unwrap();
        let y = trace.sin(&x).unwrap();
        assert_eq!(y.aval().shape().dims()[0], Dim::Dynamic(n.var().unwrap().clone()));

        let (graph, _, _) = tracers_to_jaxpr(&trace, &[n, x], &[y]).unwrap();
        assert_eq!(graph.invars.len(), 2);
        assert!(graph.invars[1].aval().dim_vars().any(|v| *v == graph.invars[0]));
        crate::trace::check_jaxpr(&graph).unwrap();

        let known = trace.new_const(Array::scalar(4.0, DType::Int32));
        let z = trace.new_dynamic_arg(DType::Float32, &[DimSpec::Of(known)]).unwrap();
        assert_eq!(z.aval(), AbstractValue::array(vec![4], DType::Float32));
    }
}
