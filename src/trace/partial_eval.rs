//! Splitting graphs into a known half and a staged half.
//!
//! [`partial_eval_jaxpr_stateful`] walks a finished graph once, tagging every
//! variable with `(unknown, instantiated)`. Known equations go to the known
//! graph; equations touching unknown values go to the staged graph. Known
//! values the staged graph reads cross over as residuals, which the known
//! graph returns after its own outputs and the staged graph takes as its
//! leading inputs.
//!
//! A [`SavePolicy`] decides, per known equation, whether its results cross as
//! residuals, are recomputed on the staged side, or are offloaded to another
//! memory kind and reloaded. Higher-order primitives split themselves through
//! a [`PartialEvalRule`](crate::trace::PartialEvalRule), which may recurse
//! into the splitter.

use crate::trace::cache::SplitKey;
use crate::trace::effects::{has_effects_for_partial_eval, Effects};
use crate::trace::ir::{check_jaxpr, convert_constvars_jaxpr, prune_jaxpr_outputs};
use crate::trace::primitive::call_jaxpr;
use crate::trace::tracer::trace_to_jaxpr_nounits;
use crate::trace::{AbstractValue, Atom, Equation, Graph, Param, Params, PartialVal, Primitive, Registry, Var};
use crate::{Error, Result, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// What to do with the results of a known equation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RematCase {
    /// Pass results to the staged side as residuals.
    Saveable,
    /// Duplicate the equation onto the staged side.
    Recompute,
    /// Store results in memory kind `dst` on the known side and reload them
    /// into `src` on the staged side.
    Offloadable {
        /// Memory kind the staged side reads from.
        src: String,
        /// Memory kind residuals are stored in.
        dst: String,
    },
}

type PolicyFn = dyn Fn(&Primitive, &[AbstractValue], &Params) -> RematCase + Send + Sync;

/// Save, recompute or offload decision for known equations.
///
/// The decision applies to a whole equation, never to individual results.
#[derive(Clone, Default)]
pub enum SavePolicy {
    /// Every result is a residual.
    #[default]
    EverythingSaveable,
    /// Every known equation is recomputed on the staged side.
    NothingSaveable,
    /// Results of `dot` are residuals; everything else is recomputed.
    DotsSaveable,
    /// Caller-supplied decision. Compared by pointer.
    Custom(Arc<PolicyFn>),
}

impl SavePolicy {
    /// Policy backed by a closure over the primitive, operand types and params.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Primitive, &[AbstractValue], &Params) -> RematCase + Send + Sync + 'static,
    {
        SavePolicy::Custom(Arc::new(f))
    }

    /// Decision for one equation.
    pub fn decide(&self, eqn: &Equation) -> RematCase {
        match self {
            SavePolicy::EverythingSaveable => RematCase::Saveable,
            SavePolicy::NothingSaveable => RematCase::Recompute,
            SavePolicy::DotsSaveable if eqn.primitive == Primitive::Dot => RematCase::Saveable,
            SavePolicy::DotsSaveable => RematCase::Recompute,
            SavePolicy::Custom(f) => {
                let avals: Vec<AbstractValue> = eqn.invars.iter().map(|a| a.aval().clone()).collect();
                f(&eqn.primitive, &avals, &eqn.params)
            }
        }
    }

    fn custom_ptr(f: &Arc<PolicyFn>) -> *const () {
        Arc::as_ptr(f) as *const ()
    }
}

impl PartialEq for SavePolicy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SavePolicy::Custom(a), SavePolicy::Custom(b)) => Self::custom_ptr(a) == Self::custom_ptr(b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl Eq for SavePolicy {}

impl Hash for SavePolicy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        if let SavePolicy::Custom(f) = self {
            (Self::custom_ptr(f) as usize).hash(state);
        }
    }
}

impl fmt::Debug for SavePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SavePolicy::EverythingSaveable => write!(f, "EverythingSaveable"),
            SavePolicy::NothingSaveable => write!(f, "NothingSaveable"),
            SavePolicy::DotsSaveable => write!(f, "DotsSaveable"),
            SavePolicy::Custom(p) => write!(f, "Custom({:p})", Self::custom_ptr(p)),
        }
    }
}

/// Result of a custom partial evaluation rule for one equation.
#[derive(Debug, Clone)]
pub struct CustomSplit {
    /// Equation for the known graph, if any.
    pub known_eqn: Option<Equation>,
    /// Equation for the staged graph, if any.
    pub staged_eqn: Option<Equation>,
    /// Per equation output: unknown.
    pub out_unknowns: Vec<bool>,
    /// Per equation output: available on the staged side.
    pub out_inst: Vec<bool>,
    /// Known variables the staged equation reads.
    pub residuals: Vec<Var>,
}

/// A graph split into known and staged halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSplit {
    /// Inputs: known inputs, then reference residuals that are not inputs.
    /// Outputs: known outputs, then `num_res` residuals.
    pub jaxpr_known: Graph,
    /// Inputs: `num_res` residuals, then `num_res_ref` reference residuals,
    /// then the instantiated inputs.
    /// Outputs: the instantiated outputs.
    pub jaxpr_staged: Graph,
    /// Per output: computed by the staged graph only.
    pub out_unknowns: Vec<bool>,
    /// Per output: returned by the staged graph.
    pub out_inst: Vec<bool>,
    /// Number of value residuals.
    pub num_res: usize,
    /// Number of reference residuals threaded into both graphs.
    pub num_res_ref: usize,
}

impl StagedSplit {
    /// Types of the value residuals.
    pub fn residual_avals(&self) -> Vec<AbstractValue> {
        self.jaxpr_staged.invars.iter().take(self.num_res).map(|v| v.aval().clone()).collect()
    }

    /// Number of known graph outputs that are outputs of the split graph.
    pub fn num_known_outputs(&self) -> usize {
        self.jaxpr_known.outvars.len().saturating_sub(self.num_res)
    }
}

#[derive(Default)]
struct OrderedVars {
    order: Vec<Var>,
    seen: HashSet<Var>,
}

impl OrderedVars {
    fn insert(&mut self, v: Var) {
        if self.seen.insert(v.clone()) {
            self.order.push(v);
        }
    }
}

struct Splitter<'a> {
    registry: &'a Registry,
    policy: &'a SavePolicy,
    env: HashMap<Var, (bool, bool)>,
    residuals: OrderedVars,
    residual_refs: OrderedVars,
    known_eqns: Vec<Equation>,
    staged_eqns: Vec<Equation>,
}

impl<'a> Splitter<'a> {
    fn new(registry: &'a Registry, policy: &'a SavePolicy) -> Self {
        Self {
            registry,
            policy,
            env: HashMap::new(),
            residuals: OrderedVars::default(),
            residual_refs: OrderedVars::default(),
            known_eqns: Vec::new(),
            staged_eqns: Vec::new(),
        }
    }

    fn read(&self, atom: &Atom) -> Result<(bool, bool)> {
        match atom {
            Atom::Lit(_) => Ok((false, true)),
            Atom::Var(v) => self.env.get(v).copied().ok_or_else(|| Error::UnboundVar { var: v.to_string() }),
        }
    }

    fn write(&mut self, unknown: bool, inst: bool, v: &Var) {
        assert!(!(unknown && !inst), "{} is unknown but not instantiated", v);
        if !v.is_dropped() {
            self.env.insert(v.clone(), (unknown, inst));
        }
    }

    fn ensure_instantiated(&mut self, inst: bool, atom: &Atom) -> Result<()> {
        let Atom::Var(v) = atom else {
            return Ok(());
        };
        for d in v.aval().dim_vars() {
            let (_, dim_inst) = self.read(&Atom::Var(d.clone()))?;
            if !dim_inst {
                self.residuals.insert(d.clone());
            }
        }
        if !inst {
            self.residuals.insert(v.clone());
        }
        Ok(())
    }

    fn stage(&mut self, eqn: &Equation, inst_in: &[bool]) -> Result<()> {
        for (atom, &inst) in eqn.invars.iter().zip(inst_in) {
            self.ensure_instantiated(inst, atom)?;
        }
        self.staged_eqns.push(eqn.clone());
        Ok(())
    }

    fn process(&mut self, eqn: &Equation) -> Result<()> {
        let tags = eqn.invars.iter().map(|a| self.read(a)).collect::<Result<Vec<_>>>()?;
        let (unks_in, inst_in): (Vec<bool>, Vec<bool>) = tags.into_iter().unzip();

        if let Some(rule) = self.registry.partial_eval_rule(&eqn.primitive) {
            let split = rule(self.registry, self.policy, &unks_in, &inst_in, eqn)?;
            for (what, tags) in [("rule output unknowns", &split.out_unknowns), ("rule output inst", &split.out_inst)] {
                if tags.len() != eqn.outvars.len() {
                    return Err(Error::LengthMismatch { what, expected: eqn.outvars.len(), actual: tags.len() });
                }
            }
            log::trace!("{} split by its rule: {} residual(s)", eqn.primitive, split.residuals.len());
            self.known_eqns.extend(split.known_eqn);
            self.staged_eqns.extend(split.staged_eqn);
            for r in split.residuals {
                if r.aval().is_ref() {
                    self.residual_refs.insert(r);
                } else {
                    self.residuals.insert(r);
                }
            }
            for ((v, &unknown), &inst) in eqn.outvars.iter().zip(&split.out_unknowns).zip(&split.out_inst) {
                self.write(unknown, inst, v);
            }
            return Ok(());
        }

        if unks_in.iter().any(|&u| u) {
            log::trace!("{} staged", eqn.primitive);
            self.stage(eqn, &inst_in)?;
            for v in &eqn.outvars {
                self.write(true, true, v);
            }
            return Ok(());
        }

        self.known_eqns.push(eqn.clone());
        let case = self.policy.decide(eqn);
        if has_effects_for_partial_eval(&eqn.effects) || case == RematCase::Saveable {
            log::trace!("{} known", eqn.primitive);
            for v in &eqn.outvars {
                self.write(false, false, v);
            }
            return Ok(());
        }
        match case {
            RematCase::Offloadable { src, dst } => self.offload(eqn, &src, &dst),
            _ => {
                log::trace!("{} known and recomputed", eqn.primitive);
                self.stage(eqn, &inst_in)?;
                for v in &eqn.outvars {
                    self.write(false, true, v);
                }
            }
        }
        Ok(())
    }

    /// Store the results in `dst` on the known side and reload them from
    /// `src` on the staged side.
    fn offload(&mut self, eqn: &Equation, src: &str, dst: &str) {
        let live: Vec<Var> = eqn.outvars.iter().filter(|v| !v.is_dropped()).cloned().collect();
        if live.is_empty() {
            return;
        }
        log::trace!("{} offloaded to {}", eqn.primitive, dst);
        let stored: Vec<Var> = live.iter().map(|v| Var::new(v.aval().clone())).collect();
        let store = eqn.rebuild(
            live.iter().map(Atom::from).collect(),
            stored.clone(),
            Params::new().with("memory_kind", Param::Str(dst.to_string())),
            Effects::new(),
        );
        let reload = eqn.rebuild(
            stored.iter().map(Atom::from).collect(),
            live.clone(),
            Params::new().with("memory_kind", Param::Str(src.to_string())),
            Effects::new(),
        );
        self.known_eqns.push(Equation { primitive: Primitive::DevicePut, ..store });
        self.staged_eqns.push(Equation { primitive: Primitive::DevicePut, ..reload });
        for r in &stored {
            self.write(false, true, r);
            self.residuals.insert(r.clone());
        }
        for v in &live {
            self.write(false, true, v);
        }
    }
}

fn check_mask<T>(what: &'static str, mask: &[T], expected: usize) -> Result<()> {
    if mask.len() != expected {
        return Err(Error::LengthMismatch { what, expected, actual: mask.len() });
    }
    Ok(())
}

fn select<T: Clone>(items: &[T], mask: &[bool], keep: bool) -> Vec<T> {
    items.iter().zip(mask).filter(|(_, &m)| m == keep).map(|(x, _)| x.clone()).collect()
}

/// Split `jaxpr` given which inputs are unknown.
///
/// `in_inst` marks inputs already available to the staged graph;
/// `ensure_out_unknowns` and `ensure_out_inst` force outputs into the staged
/// graph. Reference residuals are allowed and reported in `num_res_ref`.
///
/// # Panics
///
/// Panics if an output ends up unknown but not instantiated, which means a
/// partial evaluation rule or the forcing masks are inconsistent.
pub fn partial_eval_jaxpr_stateful(
    registry: &Registry,
    jaxpr: &Graph,
    in_unknowns: &[bool],
    in_inst: &[bool],
    ensure_out_unknowns: &[bool],
    ensure_out_inst: &[bool],
    policy: &SavePolicy,
) -> Result<StagedSplit> {
    check_mask("unknown inputs", in_unknowns, jaxpr.invars.len())?;
    check_mask("instantiated inputs", in_inst, jaxpr.invars.len())?;
    check_mask("forced unknown outputs", ensure_out_unknowns, jaxpr.outvars.len())?;
    check_mask("forced instantiated outputs", ensure_out_inst, jaxpr.outvars.len())?;

    let key = SplitKey {
        graph: jaxpr.clone(),
        in_unknowns: in_unknowns.to_vec(),
        in_inst: in_inst.to_vec(),
        ensure_out_unknowns: ensure_out_unknowns.to_vec(),
        ensure_out_inst: ensure_out_inst.to_vec(),
        policy: policy.clone(),
    };
    if let Some(hit) = registry.cache().lookup_split(&key) {
        return Ok(hit);
    }
    let split = split_jaxpr(registry, jaxpr, in_unknowns, in_inst, ensure_out_unknowns, ensure_out_inst, policy)?;
    registry.cache().insert_split(key, split.clone());
    Ok(split)
}

fn split_jaxpr(
    registry: &Registry,
    jaxpr: &Graph,
    in_unknowns: &[bool],
    in_inst: &[bool],
    ensure_out_unknowns: &[bool],
    ensure_out_inst: &[bool],
    policy: &SavePolicy,
) -> Result<StagedSplit> {
    let mut splitter = Splitter::new(registry, policy);
    for ((v, &unknown), &inst) in jaxpr.invars.iter().zip(in_unknowns).zip(in_inst) {
        splitter.write(unknown, inst, v);
    }
    for v in &jaxpr.constvars {
        splitter.write(false, true, v);
    }
    for eqn in &jaxpr.eqns {
        splitter.process(eqn)?;
    }

    let tags = jaxpr.outvars.iter().map(|a| splitter.read(a)).collect::<Result<Vec<_>>>()?;
    let (mut out_unknowns, mut out_inst): (Vec<bool>, Vec<bool>) = tags.into_iter().unzip();
    for ((atom, &inst), &ensure) in jaxpr.outvars.iter().zip(&out_inst).zip(ensure_out_inst) {
        if ensure {
            splitter.ensure_instantiated(inst, atom)?;
        }
    }
    for (i, (unknown, inst)) in out_unknowns.iter_mut().zip(out_inst.iter_mut()).enumerate() {
        *unknown |= ensure_out_unknowns[i];
        *inst |= ensure_out_inst[i];
        assert!(!(*unknown && !*inst), "output {} of {} is unknown but not instantiated", i, jaxpr.name);
    }

    let Splitter { residuals, residual_refs, known_eqns, staged_eqns, .. } = splitter;
    let residuals = residuals.order;
    let ins_known = select(&jaxpr.invars, in_unknowns, false);
    let non_input_res_refs: Vec<Var> =
        residual_refs.order.into_iter().filter(|r| !ins_known.contains(r)).collect();

    let known_invars: Vec<Var> = ins_known.iter().chain(&non_input_res_refs).cloned().collect();
    let mut known_outvars = select(&jaxpr.outvars, &out_unknowns, false);
    known_outvars.extend(residuals.iter().map(Atom::from));
    let jaxpr_known = Graph::new(
        format!("{}_known", jaxpr.name),
        jaxpr.constvars.clone(),
        known_invars,
        known_outvars,
        known_eqns,
    )?;

    let staged_invars: Vec<Var> = residuals
        .iter()
        .chain(&non_input_res_refs)
        .cloned()
        .chain(select(&jaxpr.invars, in_inst, true))
        .collect();
    let jaxpr_staged = Graph::new(
        format!("{}_staged", jaxpr.name),
        jaxpr.constvars.clone(),
        staged_invars,
        select(&jaxpr.outvars, &out_inst, true),
        staged_eqns,
    )?;

    if registry.config().enable_checks {
        check_jaxpr(&jaxpr_known)?;
        check_jaxpr(&jaxpr_staged)?;
    }
    log::debug!(
        "split `{}`: {} known and {} staged equation(s), {} residual(s), {} reference residual(s)",
        jaxpr.name,
        jaxpr_known.eqns.len(),
        jaxpr_staged.eqns.len(),
        residuals.len(),
        non_input_res_refs.len()
    );
    Ok(StagedSplit {
        jaxpr_known,
        jaxpr_staged,
        out_unknowns,
        out_inst,
        num_res: residuals.len(),
        num_res_ref: non_input_res_refs.len(),
    })
}

/// [`partial_eval_jaxpr_stateful`] for graphs that need no reference residuals.
///
/// Fails with [`Error::Unsupported`] if a reference would have to cross
/// between the two halves.
pub fn partial_eval_jaxpr_custom(
    registry: &Registry,
    jaxpr: &Graph,
    in_unknowns: &[bool],
    in_inst: &[bool],
    ensure_out_unknowns: &[bool],
    ensure_out_inst: &[bool],
    policy: &SavePolicy,
) -> Result<StagedSplit> {
    let split =
        partial_eval_jaxpr_stateful(registry, jaxpr, in_unknowns, in_inst, ensure_out_unknowns, ensure_out_inst, policy)?;
    if split.num_res_ref > 0 {
        return Err(Error::Unsupported(format!(
            "splitting `{}` needs {} reference residual(s); use partial_eval_jaxpr_stateful",
            jaxpr.name, split.num_res_ref
        )));
    }
    Ok(split)
}

/// Residuals of a split that are already available without being returned.
#[derive(Debug, Clone)]
pub struct ResidualForwarding {
    /// The known graph without the forwarded residual outputs.
    pub jaxpr_known: Graph,
    /// Per residual: the known graph input it is identical to.
    pub in_fwd: Vec<Option<usize>>,
    /// Per residual: the known graph output it is identical to.
    pub out_fwd: Vec<Option<usize>>,
}

impl ResidualForwarding {
    /// Leading operands of the staged graph, given the inputs and the results
    /// of the pruned known graph.
    pub fn residuals(&self, known_inputs: &[Value], known_outputs: &[Value]) -> Result<Vec<Value>> {
        let materialized = self.in_fwd.iter().zip(&self.out_fwd).filter(|(i, o)| i.is_none() && o.is_none()).count();
        let num_primal = known_outputs.len().checked_sub(materialized).ok_or(Error::LengthMismatch {
            what: "known outputs",
            expected: materialized,
            actual: known_outputs.len(),
        })?;
        let mut saved = known_outputs[num_primal..].iter();
        self.in_fwd
            .iter()
            .zip(&self.out_fwd)
            .map(|(i, o)| {
                let found = match (i, o) {
                    (Some(i), _) => known_inputs.get(*i),
                    (None, Some(o)) => known_outputs[..num_primal].get(*o),
                    (None, None) => saved.next(),
                };
                found.cloned().ok_or(Error::LengthMismatch {
                    what: "forwarded residual sources",
                    expected: self.in_fwd.len(),
                    actual: known_inputs.len() + known_outputs.len(),
                })
            })
            .collect()
    }
}

/// Find residuals identical to a known input or a known output and drop them
/// from the known graph's results.
pub fn forward_residuals(split: &StagedSplit) -> Result<ResidualForwarding> {
    let known = &split.jaxpr_known;
    let num_primal = split.num_known_outputs();
    let (primals, residuals) = known.outvars.split_at(num_primal);
    let mut in_fwd = Vec::with_capacity(residuals.len());
    let mut out_fwd = Vec::with_capacity(residuals.len());
    for r in residuals {
        let var = r.as_var();
        let i = var.and_then(|v| known.invars.iter().position(|x| x == v));
        let o = match i {
            Some(_) => None,
            None => var.and_then(|v| primals.iter().position(|p| p.as_var() == Some(v))),
        };
        in_fwd.push(i);
        out_fwd.push(o);
    }
    let keep: Vec<bool> = std::iter::repeat(true)
        .take(num_primal)
        .chain(in_fwd.iter().zip(&out_fwd).map(|(i, o)| i.is_none() && o.is_none()))
        .collect();
    let jaxpr_known = prune_jaxpr_outputs(known, &keep)?;
    Ok(ResidualForwarding { jaxpr_known, in_fwd, out_fwd })
}

/// Split rule for `call`: split the body and apply it on both sides.
fn call_partial_eval_rule(
    registry: &Registry,
    policy: &SavePolicy,
    unks_in: &[bool],
    inst_in: &[bool],
    eqn: &Equation,
) -> Result<CustomSplit> {
    let body = call_jaxpr(&eqn.primitive, &eqn.params)?;
    let no_force = vec![false; body.outvars.len()];
    let split = partial_eval_jaxpr_stateful(registry, body, unks_in, inst_in, &no_force, &no_force, policy)?;
    let (num_res, num_res_ref) = (split.num_res, split.num_res_ref);
    let (jaxpr_known, in_fwd, out_fwd) = if registry.config().forward_residuals {
        let fwd = forward_residuals(&split)?;
        (fwd.jaxpr_known, fwd.in_fwd, fwd.out_fwd)
    } else {
        (split.jaxpr_known.clone(), vec![None; num_res], vec![None; num_res])
    };

    let known_positions: Vec<usize> = (0..eqn.invars.len()).filter(|&i| !unks_in[i]).collect();
    let ins_known = select(&eqn.invars, unks_in, false);
    let ins_staged = select(&eqn.invars, inst_in, true);
    let mut out_binders_known = select(&eqn.outvars, &split.out_unknowns, false);
    let out_binders_staged = select(&eqn.outvars, &split.out_inst, true);

    let staged_in_avals = split.jaxpr_staged.in_avals();
    let res_ref_binders: Vec<Var> =
        staged_in_avals[num_res..num_res + num_res_ref].iter().cloned().map(Var::new).collect();
    let mut res_val_binders = Vec::new();
    let mut res_val_atoms = Vec::with_capacity(num_res);
    let mut residuals = Vec::new();
    for (r, aval) in staged_in_avals[..num_res].iter().enumerate() {
        match (in_fwd[r], out_fwd[r]) {
            (Some(i), _) if i < ins_known.len() => {
                let atom = ins_known[i].clone();
                if let (Atom::Var(v), false) = (&atom, inst_in[known_positions[i]]) {
                    residuals.push(v.clone());
                }
                res_val_atoms.push(atom);
            }
            (Some(i), _) => res_val_atoms.push(Atom::from(&res_ref_binders[i - ins_known.len()])),
            (None, Some(o)) => {
                if out_binders_known[o].is_dropped() {
                    out_binders_known[o] = Var::new(aval.clone());
                }
                residuals.push(out_binders_known[o].clone());
                res_val_atoms.push(Atom::from(&out_binders_known[o]));
            }
            (None, None) => {
                let v = Var::new(aval.clone());
                res_val_binders.push(v.clone());
                residuals.push(v.clone());
                res_val_atoms.push(Atom::Var(v));
            }
        }
    }
    residuals.extend(res_ref_binders.iter().cloned());

    let known_effects = jaxpr_known.effects.clone();
    let known_invars: Vec<Atom> = ins_known.into_iter().chain(res_ref_binders.iter().map(Atom::from)).collect();
    let known_outvars: Vec<Var> = out_binders_known.into_iter().chain(res_val_binders).collect();
    let known_eqn = if known_outvars.is_empty() && !has_effects_for_partial_eval(&known_effects) {
        None
    } else {
        let params = eqn.params.clone().with("call_jaxpr", Param::Graph(Arc::new(jaxpr_known)));
        Some(eqn.rebuild(known_invars, known_outvars, params, known_effects))
    };

    let staged = split.jaxpr_staged;
    let staged_eqn = if out_binders_staged.is_empty() && !has_effects_for_partial_eval(&staged.effects) {
        // The known side still reads the reference binders.
        residuals.clear();
        if known_eqn.is_some() {
            residuals.extend(res_ref_binders.iter().cloned());
        }
        None
    } else {
        let staged_effects = staged.effects.clone();
        let staged_invars: Vec<Atom> =
            res_val_atoms.into_iter().chain(res_ref_binders.iter().map(Atom::from)).chain(ins_staged).collect();
        let params = eqn.params.clone().with("call_jaxpr", Param::Graph(Arc::new(staged)));
        Some(eqn.rebuild(staged_invars, out_binders_staged, params, staged_effects))
    };

    Ok(CustomSplit {
        known_eqn,
        staged_eqn,
        out_unknowns: split.out_unknowns,
        out_inst: split.out_inst,
        residuals,
    })
}

/// Split of a graph evaluated on partially known inputs.
#[derive(Debug, Clone)]
pub struct NounitsSplit {
    /// Staged graph: residual inputs first, then the unknown inputs.
    pub jaxpr_unknown: Graph,
    /// Per output: computed by `jaxpr_unknown`.
    pub out_unknowns: Vec<bool>,
    /// Values of the known outputs, in order.
    pub known_outs: Vec<Value>,
    /// Residual values that are neither a known input nor a known output.
    pub residuals: Vec<Value>,
    /// Per residual input: the known input it is.
    pub input_fwds: Vec<Option<usize>>,
    /// Per residual input: the known output it is.
    pub output_fwds: Vec<Option<usize>>,
}

impl NounitsSplit {
    /// Values for the residual inputs of `jaxpr_unknown`.
    ///
    /// `known_inputs` are the known input values, in order.
    pub fn residual_args(&self, known_inputs: &[Value]) -> Result<Vec<Value>> {
        let mut saved = self.residuals.iter();
        self.input_fwds
            .iter()
            .zip(&self.output_fwds)
            .map(|(i, o)| {
                let found = match (i, o) {
                    (Some(i), _) => known_inputs.get(*i),
                    (None, Some(o)) => self.known_outs.get(*o),
                    (None, None) => saved.next(),
                };
                found.cloned().ok_or(Error::LengthMismatch {
                    what: "known inputs",
                    expected: self.input_fwds.len(),
                    actual: known_inputs.len(),
                })
            })
            .collect()
    }
}

/// Evaluate `jaxpr` with the known inputs of `in_pvals`, staging the rest.
///
/// Known work happens now. Residuals identical to a known input or a known
/// output are reported in the forwarding maps instead of being returned
/// again, when residual forwarding is enabled.
pub fn partial_eval_jaxpr_nounits(
    registry: &Arc<Registry>,
    jaxpr: &Graph,
    consts: &[Value],
    in_pvals: &[PartialVal],
    instantiate: &[bool],
) -> Result<NounitsSplit> {
    check_mask("partial inputs", in_pvals, jaxpr.invars.len())?;
    let traced = trace_to_jaxpr_nounits(
        registry,
        &jaxpr.name,
        &|t, args| t.eval_graph(jaxpr, consts, args),
        in_pvals,
        instantiate,
    )?;
    let known_inputs: Vec<&Value> = in_pvals.iter().filter_map(PartialVal::get_known).collect();
    let known_outs: Vec<Value> = traced.out_pvals.iter().filter_map(|pv| pv.get_known().cloned()).collect();
    let out_unknowns = traced.out_pvals.iter().map(|pv| !pv.is_known()).collect();

    let forward = registry.config().forward_residuals;
    let mut residuals = Vec::new();
    let mut input_fwds = Vec::with_capacity(traced.consts.len());
    let mut output_fwds = Vec::with_capacity(traced.consts.len());
    for value in traced.consts {
        let i = known_inputs.iter().position(|v| v.is_same(&value)).filter(|_| forward);
        let o = match i {
            None if forward => known_outs.iter().position(|v| v.is_same(&value)),
            _ => None,
        };
        if i.is_none() && o.is_none() {
            residuals.push(value);
        }
        input_fwds.push(i);
        output_fwds.push(o);
    }

    let jaxpr_unknown = convert_constvars_jaxpr(&traced.jaxpr);
    log::debug!(
        "partially evaluated `{}`: {} staged equation(s), {} residual(s), {} forwarded",
        jaxpr.name,
        jaxpr_unknown.eqns.len(),
        residuals.len(),
        input_fwds.len() - residuals.len()
    );
    Ok(NounitsSplit { jaxpr_unknown, out_unknowns, known_outs, residuals, input_fwds, output_fwds })
}

pub(crate) fn register_rules(registry: &mut Registry) {
    registry.register_partial_eval_rule(Primitive::Call, call_partial_eval_rule);
}
