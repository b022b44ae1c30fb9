//! Property-based tests for jaxpr-rs using proptest.
//!
//! Random straight-line programs are traced, then split, pruned and
//! evaluated. Every transformation must agree with evaluating the untransformed
//! graph directly.

use jaxpr_rs::trace::{
    check_jaxpr, dce_jaxpr, eval_jaxpr, jaxpr_forwarding, make_jaxpr, partial_eval_jaxpr_custom,
    partial_eval_jaxpr_nounits, AbstractValue, Graph, JaxprTrace, PartialVal, Registry, SavePolicy, StagedSplit,
    Tracer,
};
use jaxpr_rs::{Array, Config, DType, Result, Value};
use proptest::prelude::*;
use std::sync::Arc;

const WIDTH: usize = 3;
const NUM_INPUTS: usize = 3;

// =============================================================================
// GENERATORS
// =============================================================================

/// One step of a random program: an opcode and two operand picks.
#[derive(Debug, Clone)]
struct Step {
    op: u8,
    lhs: usize,
    rhs: usize,
}

#[derive(Debug, Clone)]
struct Program {
    steps: Vec<Step>,
    outputs: Vec<usize>,
}

fn arb_program() -> impl Strategy<Value = Program> {
    let step = (0u8..8, any::<usize>(), any::<usize>()).prop_map(|(op, lhs, rhs)| Step { op, lhs, rhs });
    (prop::collection::vec(step, 1..12), prop::collection::vec(any::<usize>(), 1..4))
        .prop_map(|(steps, outputs)| Program { steps, outputs })
}

fn arb_args() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(prop::collection::vec(-2.0f32..2.0, WIDTH), NUM_INPUTS)
        .prop_map(|rows| rows.into_iter().map(|r| Value::from(Array::from_vec(r, vec![WIDTH]))).collect())
}

fn arb_mask() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), NUM_INPUTS)
}

fn arb_policy() -> impl Strategy<Value = SavePolicy> {
    prop_oneof![
        Just(SavePolicy::EverythingSaveable),
        Just(SavePolicy::NothingSaveable),
        Just(SavePolicy::DotsSaveable),
    ]
}

// =============================================================================
// HELPERS
// =============================================================================

fn registry() -> Arc<Registry> {
    Arc::new(Registry::new(Config { enable_checks: true, ..Config::default() }))
}

fn run_program(program: &Program, t: &JaxprTrace, xs: &[Tracer]) -> Result<Vec<Tracer>> {
    let mut vals: Vec<Tracer> = xs.to_vec();
    for step in &program.steps {
        let a = vals[step.lhs % vals.len()].clone();
        let b = vals[step.rhs % vals.len()].clone();
        let out = match step.op {
            0 => t.sin(&a)?,
            1 => t.cos(&a)?,
            2 => t.neg(&a)?,
            3 => t.tanh(&a)?,
            4 => t.add(&a, &b)?,
            5 => t.mul(&a, &b)?,
            6 => t.sub(&a, &b)?,
            _ => t.convert_element_type(&a, DType::Float32)?,
        };
        vals.push(out);
    }
    Ok(program.outputs.iter().map(|&i| vals[i % vals.len()].clone()).collect())
}

fn trace_program(reg: &Arc<Registry>, program: &Program) -> Graph {
    let avals = vec![AbstractValue::array(vec![WIDTH], DType::Float32); NUM_INPUTS];
    make_jaxpr(reg, "prog", &|t, xs| run_program(program, t, xs), &avals).unwrap().jaxpr
}

fn select<T: Clone>(items: &[T], mask: &[bool], keep: bool) -> Vec<T> {
    items.iter().zip(mask).filter(|(_, &m)| m == keep).map(|(x, _)| x.clone()).collect()
}

fn run_split(reg: &Registry, split: &StagedSplit, unknowns: &[bool], args: &[Value]) -> Vec<Value> {
    let known_out = eval_jaxpr(reg, &split.jaxpr_known, &[], &select(args, unknowns, false)).unwrap();
    let num_known = split.num_known_outputs();
    let mut staged_args = known_out[num_known..].to_vec();
    staged_args.extend(select(args, unknowns, true));
    let staged_out = eval_jaxpr(reg, &split.jaxpr_staged, &[], &staged_args).unwrap();

    let (mut known, mut staged) = (known_out[..num_known].iter(), staged_out.iter());
    split
        .out_unknowns
        .iter()
        .zip(&split.out_inst)
        .map(|(&unknown, &inst)| {
            let from_known = if unknown { None } else { known.next() };
            let from_staged = if inst { staged.next() } else { None };
            if unknown { from_staged } else { from_known }.unwrap().clone()
        })
        .collect()
}

fn same(a: &Value, b: &Value) -> bool {
    let (a, b) = (a.as_array().unwrap().to_vec(), b.as_array().unwrap().to_vec());
    a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| (x - y).abs() <= 1e-5 * (1.0 + x.abs()))
}

// =============================================================================
// PARTIAL EVALUATION
// =============================================================================

proptest! {
    #[test]
    fn test_split_preserves_semantics(
        program in arb_program(),
        args in arb_args(),
        unknowns in arb_mask(),
        policy in arb_policy(),
    ) {
        let reg = registry();
        let graph = trace_program(&reg, &program);
        let direct = eval_jaxpr(&reg, &graph, &[], &args).unwrap();
        let no_force = vec![false; graph.outvars.len()];
        let split = partial_eval_jaxpr_custom(&reg, &graph, &unknowns, &unknowns, &no_force, &no_force, &policy).unwrap();

        prop_assert!(check_jaxpr(&split.jaxpr_known).is_ok());
        prop_assert!(check_jaxpr(&split.jaxpr_staged).is_ok());
        for (unknown, inst) in split.out_unknowns.iter().zip(&split.out_inst) {
            prop_assert!(!unknown || *inst);
        }
        let out = run_split(&reg, &split, &unknowns, &args);
        for (a, b) in direct.iter().zip(&out) {
            prop_assert!(same(a, b), "split disagrees: {:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_outputs_depending_on_unknowns_are_unknown(program in arb_program(), unknowns in arb_mask()) {
        let reg = registry();
        let graph = trace_program(&reg, &program);
        let no_force = vec![false; graph.outvars.len()];
        let split = partial_eval_jaxpr_custom(
            &reg, &graph, &unknowns, &unknowns, &no_force, &no_force, &SavePolicy::default(),
        ).unwrap();
        if unknowns.iter().all(|u| !u) {
            prop_assert!(split.out_unknowns.iter().all(|u| !u));
            prop_assert!(split.jaxpr_staged.eqns.is_empty());
        }
        if unknowns.iter().all(|u| *u) {
            prop_assert!(split.out_unknowns.iter().all(|u| *u));
            prop_assert_eq!(split.num_res, 0);
        }
    }

    #[test]
    fn test_nounits_preserves_semantics(program in arb_program(), args in arb_args(), unknowns in arb_mask()) {
        let reg = registry();
        let graph = trace_program(&reg, &program);
        let direct = eval_jaxpr(&reg, &graph, &[], &args).unwrap();
        let pvals: Vec<PartialVal> = args
            .iter()
            .zip(&unknowns)
            .map(|(a, &u)| if u { PartialVal::unknown(AbstractValue::of(a)) } else { PartialVal::known(a.clone()) })
            .collect();
        let pe = partial_eval_jaxpr_nounits(&reg, &graph, &[], &pvals, &vec![false; graph.outvars.len()]).unwrap();

        let mut staged_args = pe.residual_args(&select(&args, &unknowns, false)).unwrap();
        staged_args.extend(select(&args, &unknowns, true));
        let staged = eval_jaxpr(&reg, &pe.jaxpr_unknown, &[], &staged_args).unwrap();
        let (mut known, mut staged) = (pe.known_outs.iter(), staged.iter());
        for (d, &unknown) in direct.iter().zip(&pe.out_unknowns) {
            let got = if unknown { staged.next() } else { known.next() }.unwrap();
            prop_assert!(same(d, got));
        }
    }
}

// =============================================================================
// DEAD CODE ELIMINATION
// =============================================================================

proptest! {
    #[test]
    fn test_dce_is_sound(program in arb_program(), args in arb_args(), used in prop::collection::vec(any::<bool>(), 3)) {
        let reg = registry();
        let graph = trace_program(&reg, &program);
        let used: Vec<bool> = (0..graph.outvars.len()).map(|i| used[i % used.len()]).collect();
        let direct = eval_jaxpr(&reg, &graph, &[], &args).unwrap();

        let (pruned, used_inputs) = dce_jaxpr(&reg, &graph, &used, &vec![false; NUM_INPUTS]).unwrap();
        prop_assert!(check_jaxpr(&pruned).is_ok());
        prop_assert!(pruned.eqns.len() <= graph.eqns.len());
        let out = eval_jaxpr(&reg, &pruned, &[], &select(&args, &used_inputs, true)).unwrap();
        let expected = select(&direct, &used, true);
        prop_assert_eq!(out.len(), expected.len());
        for (a, b) in expected.iter().zip(&out) {
            prop_assert!(same(a, b));
        }
    }

    #[test]
    fn test_dce_is_idempotent(program in arb_program(), used in prop::collection::vec(any::<bool>(), 3)) {
        let reg = registry();
        let graph = trace_program(&reg, &program);
        let used: Vec<bool> = (0..graph.outvars.len()).map(|i| used[i % used.len()]).collect();
        let (once, _) = dce_jaxpr(&reg, &graph, &used, &vec![false; NUM_INPUTS]).unwrap();
        let all = vec![true; once.outvars.len()];
        let (twice, used_inputs) = dce_jaxpr(&reg, &once, &all, &vec![false; once.invars.len()]).unwrap();
        prop_assert_eq!(&once, &twice);
        prop_assert!(used_inputs.iter().all(|u| *u));
    }

    #[test]
    fn test_split_and_dce_commute(
        program in arb_program(),
        args in arb_args(),
        unknowns in arb_mask(),
        used in prop::collection::vec(any::<bool>(), 3),
    ) {
        let reg = registry();
        let graph = trace_program(&reg, &program);
        let used: Vec<bool> = (0..graph.outvars.len()).map(|i| used[i % used.len()]).collect();
        let direct = eval_jaxpr(&reg, &graph, &[], &args).unwrap();
        let expected = select(&direct, &used, true);
        let policy = SavePolicy::default();

        // Prune first, then split.
        let (pruned, used_inputs) = dce_jaxpr(&reg, &graph, &used, &vec![false; NUM_INPUTS]).unwrap();
        let kept_args = select(&args, &used_inputs, true);
        let kept_unknowns = select(&unknowns, &used_inputs, true);
        let no_force = vec![false; pruned.outvars.len()];
        let split = partial_eval_jaxpr_custom(&reg, &pruned, &kept_unknowns, &kept_unknowns, &no_force, &no_force, &policy)
            .unwrap();
        let out = run_split(&reg, &split, &kept_unknowns, &kept_args);
        for (a, b) in expected.iter().zip(&out) {
            prop_assert!(same(a, b));
        }

        // Split first, then prune each half with stable input arity.
        let no_force = vec![false; graph.outvars.len()];
        let split = partial_eval_jaxpr_custom(&reg, &graph, &unknowns, &unknowns, &no_force, &no_force, &policy).unwrap();
        let used_known: Vec<bool> = select(&used, &split.out_unknowns, false)
            .into_iter()
            .chain(std::iter::repeat(true).take(split.num_res))
            .collect();
        let (known, _) =
            dce_jaxpr(&reg, &split.jaxpr_known, &used_known, &vec![true; split.jaxpr_known.invars.len()]).unwrap();
        let used_staged = select(&used, &split.out_inst, true);
        let (staged, _) =
            dce_jaxpr(&reg, &split.jaxpr_staged, &used_staged, &vec![true; split.jaxpr_staged.invars.len()]).unwrap();

        let known_out = eval_jaxpr(&reg, &known, &[], &select(&args, &unknowns, false)).unwrap();
        let num_known = known_out.len() - split.num_res;
        let mut staged_args = known_out[num_known..].to_vec();
        staged_args.extend(select(&args, &unknowns, true));
        let staged_out = eval_jaxpr(&reg, &staged, &[], &staged_args).unwrap();
        let (mut known_iter, mut staged_iter) = (known_out[..num_known].iter(), staged_out.iter());
        let mut out = Vec::new();
        for ((&u, &unknown), &inst) in used.iter().zip(&split.out_unknowns).zip(&split.out_inst) {
            if !u {
                continue;
            }
            let from_known = if unknown { None } else { known_iter.next() };
            let from_staged = if inst { staged_iter.next() } else { None };
            out.push(if unknown { from_staged } else { from_known }.unwrap().clone());
        }
        prop_assert_eq!(out.len(), expected.len());
        for (a, b) in expected.iter().zip(&out) {
            prop_assert!(same(a, b));
        }
    }
}

// =============================================================================
// FORWARDING
// =============================================================================

proptest! {
    #[test]
    fn test_forwarded_outputs_are_inputs(program in arb_program(), args in arb_args()) {
        let reg = registry();
        let graph = trace_program(&reg, &program);
        let direct = eval_jaxpr(&reg, &graph, &[], &args).unwrap();
        for (out, fwd) in direct.iter().zip(jaxpr_forwarding(&reg, &graph)) {
            if let Some(i) = fwd {
                prop_assert!(out.is_same(&args[i]));
            }
        }
    }
}
