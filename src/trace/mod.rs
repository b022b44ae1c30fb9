//! Tracing, graph IR and graph transformations.
//!
//! Host functions run on [`Tracer`]s inside a [`JaxprTrace`]. Known work is
//! evaluated eagerly and unknown work is staged into a [`Graph`]. Finished
//! graphs can be split into known and staged halves
//! ([`partial_eval_jaxpr_custom`]), pruned ([`dce_jaxpr`]) and evaluated
//! ([`eval_jaxpr`]).

mod cache;
mod dce;
pub mod effects;
mod finalize;
mod forwarding;
mod interpreter;
mod ir;
mod partial_eval;
mod primitive;
mod pval;
mod tracer;

pub use cache::{CacheStats, TransformCache};
pub use dce::{dce_jaxpr, dce_jaxpr_consts};
pub use effects::{Effect, Effects};
pub use finalize::drop_unused_vars;
pub use forwarding::{forward_inputs, jaxpr_forwarding};
pub use interpreter::{eval_jaxpr, Interpreter};
pub use ir::{
    check_jaxpr, convert_constvars_jaxpr, convert_invars_to_constvars, make_jaxpr_effects, move_binders_to_back,
    move_binders_to_front, prune_jaxpr_outputs, Atom, Equation, Graph, Literal, Opaque, Param, Params, Primitive,
    SourceInfo, Var,
};
pub use partial_eval::{
    forward_residuals, partial_eval_jaxpr_custom, partial_eval_jaxpr_nounits, partial_eval_jaxpr_stateful,
    CustomSplit, NounitsSplit, RematCase, ResidualForwarding, SavePolicy, StagedSplit,
};
pub use primitive::{
    call_jaxpr, ConstFoldRule, DceRule, ForwardingRule, PartialEvalRule, PrimitiveImpl, Registry,
};
pub use pval::{AbstractValue, PartialVal, ShapedArray};
pub use tracer::{make_jaxpr, trace_to_jaxpr_nounits, DimSpec, JaxprTrace, TracedFn, TracedJaxpr, Tracer};
