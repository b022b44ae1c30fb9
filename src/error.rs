//! Error type shared by tracing, finalization, partial evaluation and DCE.

use crate::trace::Primitive;
use thiserror::Error;

/// Errors surfaced to callers of the tracing and graph transformation APIs.
///
/// Internal consistency violations (for example an output classified as
/// unknown but not instantiated after partial evaluation) are not represented
/// here; those indicate a bug in a rule and abort with a panic.
#[derive(Debug, Error)]
pub enum Error {
    /// A tracer was used after the trace that created it finished.
    #[error("encountered an escaped tracer created by {provenance}")]
    EscapedTracer {
        /// Which operation created the tracer.
        provenance: String,
    },

    /// A primitive produced a different number of results than declared.
    #[error("primitive `{primitive}` declared {expected} result(s) but produced {actual}")]
    ArityMismatch {
        /// Offending primitive.
        primitive: Primitive,
        /// Declared result count.
        expected: usize,
        /// Actual result count.
        actual: usize,
    },

    /// An input-indexed effect points past the operand list of its equation.
    #[error(
        "effect on input {index} of `{primitive}` is out of range ({num_inputs} operand(s))"
    )]
    InvalidInputEffect {
        /// Primitive carrying the effect.
        primitive: Primitive,
        /// Referenced operand index.
        index: usize,
        /// Number of operands of the equation.
        num_inputs: usize,
    },

    /// An input-indexed effect refers to a value that is not a graph input.
    #[error("effect on input {index} of `{primitive}` has no corresponding graph input")]
    UnboundInputEffect {
        /// Primitive carrying the effect.
        primitive: Primitive,
        /// Referenced operand index.
        index: usize,
    },

    /// Equation parameters must be hashable and comparable.
    #[error("parameter `{param}` of primitive `{primitive}` is not hashable")]
    UnhashableParam {
        /// Primitive being staged.
        primitive: Primitive,
        /// Name of the offending parameter.
        param: String,
    },

    /// A variable is read before any input, constant or equation binds it.
    #[error("variable {var} is read before it is bound")]
    UnboundVar {
        /// Printed name of the variable.
        var: String,
    },

    /// A mask or argument list has the wrong length.
    #[error("{what}: expected {expected} entries, got {actual}")]
    LengthMismatch {
        /// What was being checked.
        what: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// A partial value must carry exactly one of a known value or an abstract value.
    #[error("a partial value needs exactly one of a known value or an abstract value")]
    InvalidPartialVal,

    /// No implementation or rule is registered for a primitive.
    #[error("no {kind} registered for primitive `{primitive}`")]
    MissingRule {
        /// Primitive looked up.
        primitive: Primitive,
        /// Which kind of rule was missing.
        kind: &'static str,
    },

    /// A parameter required by a primitive is absent or has the wrong kind.
    #[error("primitive `{primitive}` requires parameter `{param}`")]
    MissingParam {
        /// Primitive being evaluated.
        primitive: Primitive,
        /// Name of the parameter.
        param: String,
    },

    /// Operand types or shapes are not accepted by a primitive.
    #[error("type error in `{primitive}`: {message}")]
    TypeMismatch {
        /// Primitive being checked.
        primitive: Primitive,
        /// Description of the mismatch.
        message: String,
    },

    /// A graph failed well-formedness checking.
    #[error("malformed graph: {0}")]
    InvalidGraph(String),

    /// A composition of features that is explicitly not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Failure while evaluating a primitive on concrete values.
    #[error("evaluation of `{primitive}` failed: {message}")]
    Eval {
        /// Primitive being evaluated.
        primitive: Primitive,
        /// Description of the failure.
        message: String,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
