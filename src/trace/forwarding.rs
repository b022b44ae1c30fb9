//! Output-to-input forwarding and constant folding.
//!
//! A forwarding rule reports which outputs of an equation are exactly one of
//! its operands, so tracing can reuse the operand instead of staging the
//! equation. Constant folding rules decide results from partially known
//! operands.

use crate::trace::effects::has_input_effects;
use crate::trace::primitive::call_jaxpr;
use crate::trace::{AbstractValue, Atom, Equation, Graph, Params, Primitive, Registry, Var};
use crate::Value;
use std::collections::HashMap;

/// Forwarding map of an equation, if its primitive has a rule and it has no
/// input effects.
pub fn forward_inputs(registry: &Registry, eqn: &Equation) -> Option<Vec<Option<usize>>> {
    if has_input_effects(&eqn.effects) {
        return None;
    }
    let rule = registry.forwarding_rule(&eqn.primitive)?;
    Some(rule(registry, eqn))
}

/// For each output of `graph`, the input it is identical to, if any.
pub fn jaxpr_forwarding(registry: &Registry, graph: &Graph) -> Vec<Option<usize>> {
    let mut fwd: HashMap<Var, Var> = graph.invars.iter().map(|v| (v.clone(), v.clone())).collect();
    for eqn in &graph.eqns {
        let Some(map) = forward_inputs(registry, eqn) else {
            continue;
        };
        for (out, idx) in eqn.outvars.iter().zip(map) {
            let source = idx
                .and_then(|i| eqn.invars.get(i))
                .and_then(Atom::as_var)
                .and_then(|v| fwd.get(v))
                .cloned();
            if let Some(source) = source {
                fwd.insert(out.clone(), source);
            }
        }
    }
    graph
        .outvars
        .iter()
        .map(|atom| {
            let source = fwd.get(atom.as_var()?)?;
            graph.invars.iter().position(|v| v == source)
        })
        .collect()
}

fn convert_element_type_forwarding(_: &Registry, eqn: &Equation) -> Vec<Option<usize>> {
    let same = match (eqn.invars.first(), eqn.params.dtype("new_dtype")) {
        (Some(x), Some(dtype)) => x.aval().dtype() == dtype,
        _ => false,
    };
    vec![if same { Some(0) } else { None }]
}

fn device_put_forwarding(_: &Registry, eqn: &Equation) -> Vec<Option<usize>> {
    let noop = eqn.params.get("memory_kind").is_none();
    (0..eqn.outvars.len()).map(|i| if noop { Some(i) } else { None }).collect()
}

fn literal_predicate(atom: &Atom) -> Option<bool> {
    let Atom::Lit(lit) = atom else {
        return None;
    };
    let data = lit.value.data();
    if data.iter().all(|&p| p != 0.0) {
        Some(true)
    } else if data.iter().all(|&p| p == 0.0) {
        Some(false)
    } else {
        None
    }
}

fn select_forwarding(_: &Registry, eqn: &Equation) -> Vec<Option<usize>> {
    let chosen = eqn.invars.first().and_then(literal_predicate).map(|p| if p { 1 } else { 2 });
    vec![chosen]
}

fn call_forwarding(registry: &Registry, eqn: &Equation) -> Vec<Option<usize>> {
    match call_jaxpr(&eqn.primitive, &eqn.params) {
        Ok(graph) => jaxpr_forwarding(registry, graph),
        Err(_) => vec![None; eqn.outvars.len()],
    }
}

/// `select` with a uniform known predicate and a known chosen branch.
fn select_const_fold(consts: &[Option<&Value>], _: &Params, _: &[AbstractValue]) -> Option<Vec<Value>> {
    let pred = consts.first().copied().flatten()?.as_array()?;
    let data = pred.data();
    let branch = if data.iter().all(|&p| p != 0.0) {
        1
    } else if data.iter().all(|&p| p == 0.0) {
        2
    } else {
        return None;
    };
    let value = consts.get(branch).copied().flatten()?;
    Some(vec![value.clone()])
}

pub(crate) fn register_rules(registry: &mut Registry) {
    registry.register_forwarding_rule(Primitive::ConvertElementType, convert_element_type_forwarding);
    registry.register_forwarding_rule(Primitive::DevicePut, device_put_forwarding);
    registry.register_forwarding_rule(Primitive::Select, select_forwarding);
    registry.register_forwarding_rule(Primitive::Call, call_forwarding);
    registry.register_const_fold_rule(Primitive::Select, select_const_fold);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::effects::Effects;
    use crate::trace::{Literal, Param, SourceInfo};
    use crate::{Array, DType};
    use std::sync::Arc;

    fn aval() -> AbstractValue {
        AbstractValue::array(vec![2], DType::Float32)
    }

    fn eqn(prim: Primitive, invars: Vec<Atom>, outvars: Vec<Var>, params: Params) -> Equation {
        Equation::new(invars, outvars, prim, params, Effects::new(), SourceInfo::default())
    }

    #[test]
    fn test_convert_to_same_dtype_forwards() {
        let registry = Registry::default();
        let x = Var::new(aval());
        let same = eqn(
            Primitive::ConvertElementType,
            vec![x.clone().into()],
            vec![Var::new(aval())],
            Params::new().with("new_dtype", Param::DType(DType::Float32)),
        );
        assert_eq!(forward_inputs(&registry, &same), Some(vec![Some(0)]));

        let cast = eqn(
            Primitive::ConvertElementType,
            vec![x.into()],
            vec![Var::new(AbstractValue::array(vec![2], DType::Int32))],
            Params::new().with("new_dtype", Param::DType(DType::Int32)),
        );
        assert_eq!(forward_inputs(&registry, &cast), Some(vec![None]));
    }

    #[test]
    fn test_select_with_literal_predicate() {
        let registry = Registry::default();
        let a = Var::new(aval());
        let b = Var::new(aval());
        let pred = Atom::Lit(Literal::new(Array::scalar(0.0, DType::Bool)));
        let sel = eqn(Primitive::Select, vec![pred, a.into(), b.into()], vec![Var::new(aval())], Params::new());
        assert_eq!(forward_inputs(&registry, &sel), Some(vec![Some(2)]));
    }

    #[test]
    fn test_no_rule_means_no_forwarding() {
        let registry = Registry::default();
        let x = Var::new(aval());
        let sin = eqn(Primitive::Sin, vec![x.into()], vec![Var::new(aval())], Params::new());
        assert_eq!(forward_inputs(&registry, &sin), None);
    }

    #[test]
    fn test_jaxpr_forwarding_through_call() {
        let registry = Registry::default();
        let x = Var::new(aval());
        let y = Var::new(aval());
        let s = Var::new(aval());
        let body = Graph::new(
            "body",
            vec![],
            vec![x.clone(), y.clone()],
            vec![y.clone().into(), s.clone().into()],
            vec![eqn(Primitive::Sin, vec![x.into()], vec![s], Params::new())],
        )
        .unwrap();

        let a = Var::new(aval());
        let b = Var::new(aval());
        let o1 = Var::new(aval());
        let o2 = Var::new(aval());
        let outer = Graph::new(
            "outer",
            vec![],
            vec![a.clone(), b.clone()],
            vec![o1.clone().into(), o2.clone().into(), a.clone().into()],
            vec![eqn(
                Primitive::Call,
                vec![a.into(), b.into()],
                vec![o1, o2],
                Params::new().with("call_jaxpr", Param::Graph(Arc::new(body))),
            )],
        )
        .unwrap();
        assert_eq!(jaxpr_forwarding(&registry, &outer), vec![Some(1), None, Some(0)]);
    }

    #[test]
    fn test_select_const_fold() {
        let t = Value::from(Array::scalar(1.0, DType::Bool));
        let branch = Value::from(Array::from_vec(vec![1.0, 2.0], vec![2]));
        let folded = select_const_fold(&[Some(&t), Some(&branch), None], &Params::new(), &[aval()]).unwrap();
        assert!(folded[0].is_same(&branch));
        assert!(select_const_fold(&[Some(&t), None, Some(&branch)], &Params::new(), &[aval()]).is_none());
        assert!(select_const_fold(&[None, Some(&branch), Some(&branch)], &Params::new(), &[aval()]).is_none());
    }
}
