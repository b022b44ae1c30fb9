//! Dead code elimination over finished graphs.
//!
//! A single backward pass marks variables as used, starting from the
//! selected outputs. Equations with no used result are removed unless they
//! carry an effect DCE must respect. Higher-order primitives prune their
//! bodies through a [`DceRule`](crate::trace::DceRule).

use crate::trace::cache::DceKey;
use crate::trace::effects::has_effects_for_dce;
use crate::trace::ir::{check_jaxpr, convert_constvars_jaxpr, convert_invars_to_constvars};
use crate::trace::primitive::call_jaxpr;
use crate::trace::{Equation, Graph, Param, Primitive, Registry, Var};
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;

fn check_mask(what: &'static str, mask: &[bool], expected: usize) -> Result<()> {
    if mask.len() != expected {
        return Err(Error::LengthMismatch { what, expected, actual: mask.len() });
    }
    Ok(())
}

/// Remove everything `used_outputs` does not depend on.
///
/// Returns the pruned graph, which keeps only the used outputs and the used
/// inputs, and a mask of which inputs were kept. Inputs selected by
/// `instantiate` are kept even when nothing reads them. Constant binders are
/// left untouched.
pub fn dce_jaxpr(
    registry: &Registry,
    graph: &Graph,
    used_outputs: &[bool],
    instantiate: &[bool],
) -> Result<(Graph, Vec<bool>)> {
    check_mask("used outputs", used_outputs, graph.outvars.len())?;
    check_mask("instantiated inputs", instantiate, graph.invars.len())?;
    let key = DceKey { graph: graph.clone(), used_outputs: used_outputs.to_vec(), instantiate: instantiate.to_vec() };
    if let Some(hit) = registry.cache().lookup_dce(&key) {
        return Ok(hit);
    }
    let result = dce(registry, graph, used_outputs, instantiate)?;
    registry.cache().insert_dce(key, result.clone());
    Ok(result)
}

fn dce(registry: &Registry, graph: &Graph, used_outputs: &[bool], instantiate: &[bool]) -> Result<(Graph, Vec<bool>)> {
    let mut used: HashSet<Var> = HashSet::new();
    for (atom, _) in graph.outvars.iter().zip(used_outputs).filter(|(_, u)| **u) {
        used.extend(atom.vars());
    }

    let mut kept = Vec::with_capacity(graph.eqns.len());
    for eqn in graph.eqns.iter().rev() {
        let used_outs: Vec<bool> = eqn.outvars.iter().map(|v| !v.is_dropped() && used.contains(v)).collect();
        let (used_ins, new_eqn) = match registry.dce_rule(&eqn.primitive) {
            Some(rule) => rule(registry, &used_outs, eqn)?,
            None if !used_outs.iter().any(|&u| u) && !has_effects_for_dce(&eqn.effects) => {
                (vec![false; eqn.invars.len()], None)
            }
            None => (vec![true; eqn.invars.len()], Some(eqn.clone())),
        };
        let Some(new_eqn) = new_eqn else {
            log::trace!("removed {}", eqn.primitive);
            continue;
        };
        for (atom, _) in eqn.invars.iter().zip(&used_ins).filter(|(_, u)| **u) {
            used.extend(atom.vars());
        }
        for v in &new_eqn.outvars {
            used.extend(v.aval().dim_vars().cloned());
        }
        kept.push(new_eqn);
    }
    kept.reverse();

    // Size inputs precede the inputs whose shapes mention them.
    for (v, &inst) in graph.invars.iter().zip(instantiate).rev() {
        if inst || used.contains(v) {
            used.extend(v.aval().dim_vars().cloned());
        }
    }
    let used_inputs: Vec<bool> =
        graph.invars.iter().zip(instantiate).map(|(v, &inst)| inst || used.contains(v)).collect();

    let invars = graph.invars.iter().zip(&used_inputs).filter(|(_, u)| **u).map(|(v, _)| v.clone()).collect();
    let outvars = graph.outvars.iter().zip(used_outputs).filter(|(_, u)| **u).map(|(a, _)| a.clone()).collect();
    let removed = graph.eqns.len() - kept.len();
    let pruned = Graph::new(graph.name.clone(), graph.constvars.clone(), invars, outvars, kept)?;
    if registry.config().enable_checks {
        check_jaxpr(&pruned)?;
    }
    log::debug!(
        "DCE of `{}`: removed {} equation(s) and {} input(s)",
        graph.name,
        removed,
        used_inputs.iter().filter(|u| !**u).count()
    );
    Ok((pruned, used_inputs))
}

/// [`dce_jaxpr`] that also prunes constant binders.
///
/// Returns the pruned graph, the mask of kept constants and the mask of kept
/// inputs.
pub fn dce_jaxpr_consts(
    registry: &Registry,
    graph: &Graph,
    used_outputs: &[bool],
    instantiate: &[bool],
) -> Result<(Graph, Vec<bool>, Vec<bool>)> {
    check_mask("instantiated inputs", instantiate, graph.invars.len())?;
    let num_consts = graph.constvars.len();
    let closed = convert_constvars_jaxpr(graph);
    let inst: Vec<bool> = std::iter::repeat(false).take(num_consts).chain(instantiate.iter().copied()).collect();
    let (pruned, mut used_inputs) = dce_jaxpr(registry, &closed, used_outputs, &inst)?;
    let used_inputs_tail = used_inputs.split_off(num_consts);
    let num_used_consts = used_inputs.iter().filter(|u| **u).count();
    let pruned = convert_invars_to_constvars(&pruned, num_used_consts)?;
    Ok((pruned, used_inputs, used_inputs_tail))
}

/// DCE rule for `call`: prune the body, then the equation's binders.
fn call_dce_rule(registry: &Registry, used_outputs: &[bool], eqn: &Equation) -> Result<(Vec<bool>, Option<Equation>)> {
    let body = call_jaxpr(&eqn.primitive, &eqn.params)?;
    let (body, used_inputs) = dce_jaxpr(registry, body, used_outputs, &vec![false; eqn.invars.len()])?;
    if !used_outputs.iter().any(|&u| u) && !has_effects_for_dce(&body.effects) {
        return Ok((vec![false; eqn.invars.len()], None));
    }
    let invars = eqn.invars.iter().zip(&used_inputs).filter(|(_, u)| **u).map(|(a, _)| a.clone()).collect();
    let outvars = eqn.outvars.iter().zip(used_outputs).filter(|(_, u)| **u).map(|(v, _)| v.clone()).collect();
    let effects = body.effects.clone();
    let params = eqn.params.clone().with("call_jaxpr", Param::Graph(Arc::new(body)));
    Ok((used_inputs, Some(eqn.rebuild(invars, outvars, params, effects))))
}

pub(crate) fn register_rules(registry: &mut Registry) {
    registry.register_dce_rule(Primitive::Call, call_dce_rule);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{eval_jaxpr, make_jaxpr, trace_to_jaxpr_nounits, AbstractValue, PartialVal};
    use crate::{Array, Config, DType, Value};

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(Config { enable_checks: true, ..Config::default() }))
    }

    fn vec_aval() -> AbstractValue {
        AbstractValue::array(vec![2], DType::Float32)
    }

    fn prims(graph: &Graph) -> Vec<Primitive> {
        graph.eqns.iter().map(|e| e.primitive.clone()).collect()
    }

    /// `(a, b) -> (cos a, -sin a * b)`
    fn scenario(reg: &Arc<Registry>) -> Graph {
        make_jaxpr(
            reg,
            "f",
            &|t, xs| {
                let c = t.cos(&xs[0])?;
                let e = t.neg(&t.sin(&xs[0])?)?;
                Ok(vec![c, t.mul(&e, &xs[1])?])
            },
            &[vec_aval(), vec_aval()],
        )
        .unwrap()
        .jaxpr
    }

    #[test]
    fn test_unused_output_is_removed() {
        let reg = registry();
        let graph = scenario(&reg);
        let (pruned, used_inputs) = dce_jaxpr(&reg, &graph, &[true, false], &[false, false]).unwrap();
        assert_eq!(prims(&pruned), vec![Primitive::Cos]);
        assert_eq!(used_inputs, vec![true, false]);
        assert_eq!(pruned.invars.len(), 1);
        assert_eq!(pruned.outvars.len(), 1);
    }

    #[test]
    fn test_instantiated_inputs_are_kept() {
        let reg = registry();
        let graph = scenario(&reg);
        let (pruned, used_inputs) = dce_jaxpr(&reg, &graph, &[true, false], &[false, true]).unwrap();
        assert_eq!(used_inputs, vec![true, true]);
        assert_eq!(pruned.invars.len(), 2);
        assert_eq!(pruned.eqns.len(), 1);
    }

    #[test]
    fn test_effectful_equations_survive() {
        let reg = registry();
        let graph = make_jaxpr(
            &reg,
            "f",
            &|t, xs| {
                let s = t.sin(&xs[1])?;
                t.debug_print("s", &[s])?;
                Ok(vec![t.exp(&xs[0])?])
            },
            &[vec_aval(), vec_aval()],
        )
        .unwrap()
        .jaxpr;
        let (pruned, used_inputs) = dce_jaxpr(&reg, &graph, &[false], &[false, false]).unwrap();
        assert_eq!(prims(&pruned), vec![Primitive::Sin, Primitive::DebugPrint]);
        assert_eq!(used_inputs, vec![false, true]);
        assert!(!pruned.effects.is_empty());
    }

    #[test]
    fn test_call_bodies_are_pruned() {
        let reg = registry();
        let graph = make_jaxpr(
            &reg,
            "outer",
            &|t, xs| t.call("inner", &|t, ys| Ok(vec![t.sin(&ys[0])?, t.exp(&ys[1])?]), xs),
            &[vec_aval(), vec_aval()],
        )
        .unwrap()
        .jaxpr;

        let (pruned, used_inputs) = dce_jaxpr(&reg, &graph, &[false, true], &[false, false]).unwrap();
        assert_eq!(used_inputs, vec![false, true]);
        let call = &pruned.eqns[0];
        assert_eq!(call.invars.len(), 1);
        assert_eq!(call.outvars.len(), 1);
        let body = call_jaxpr(&call.primitive, &call.params).unwrap();
        assert_eq!(prims(body), vec![Primitive::Exp]);

        let b = Value::from(Array::from_vec(vec![0.0, 1.0], vec![2]));
        let out = eval_jaxpr(&reg, &pruned, &[], &[b]).unwrap();
        assert_eq!(out[0].as_array().unwrap().to_vec(), vec![1.0, 1.0f32.exp()]);

        let (gone, _) = dce_jaxpr(&reg, &graph, &[false, false], &[false, false]).unwrap();
        assert!(gone.eqns.is_empty());
    }

    #[test]
    fn test_dce_is_idempotent() {
        let reg = registry();
        let graph = scenario(&reg);
        let (once, _) = dce_jaxpr(&reg, &graph, &[false, true], &[false, false]).unwrap();
        let (twice, used) = dce_jaxpr(&reg, &once, &[true], &vec![false; once.invars.len()]).unwrap();
        assert_eq!(once, twice);
        assert!(used.iter().all(|&u| u));
    }

    #[test]
    fn test_unused_constants_are_pruned() {
        let reg = registry();
        let a = Array::from_vec(vec![1.0, 2.0], vec![2]);
        let traced = trace_to_jaxpr_nounits(
            &reg,
            "f",
            &|t, xs| Ok(vec![t.mul(&xs[0], &xs[1])?, t.sin(&xs[1])?]),
            &[PartialVal::known(a), PartialVal::unknown(vec_aval())],
            &[false, false],
        )
        .unwrap();
        assert_eq!(traced.jaxpr.constvars.len(), 1);

        let (pruned, used_consts, used_inputs) =
            dce_jaxpr_consts(&reg, &traced.jaxpr, &[false, true], &[false]).unwrap();
        assert_eq!(used_consts, vec![false]);
        assert_eq!(used_inputs, vec![true]);
        assert!(pruned.constvars.is_empty());
        assert_eq!(prims(&pruned), vec![Primitive::Sin]);

        let (kept, used_consts, _) = dce_jaxpr_consts(&reg, &traced.jaxpr, &[true, false], &[false]).unwrap();
        assert_eq!(used_consts, vec![true]);
        assert_eq!(kept.constvars.len(), 1);
    }

    #[test]
    fn test_dce_results_are_cached() {
        let reg = registry();
        let graph = scenario(&reg);
        dce_jaxpr(&reg, &graph, &[true, true], &[false, false]).unwrap();
        let hits = reg.cache().stats().hits;
        dce_jaxpr(&reg, &graph, &[true, true], &[false, false]).unwrap();
        assert_eq!(reg.cache().stats().hits, hits + 1);
    }
}
