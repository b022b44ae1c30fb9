//! # jaxpr-rs: partial evaluation of traced array programs
//!
//! Trace host functions into a small graph IR, evaluate the parts whose
//! inputs are known, and stage the rest for later.
//!
//! ## Key Features
//!
//! - **Partial-evaluation tracing**: known work runs eagerly while tracing,
//!   unknown work is recorded as equations
//! - **Graph splitting**: split a finished graph into known and staged halves
//!   connected by residuals, with save/recompute/offload policies
//! - **Dead code elimination** that respects effects
//! - **Higher-order primitives**: `call` bodies are split and pruned
//!   recursively through per-primitive rules
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jaxpr_rs::trace::{make_jaxpr, partial_eval_jaxpr_custom, AbstractValue, Registry, SavePolicy};
//! use jaxpr_rs::DType;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(Registry::default());
//! let x = AbstractValue::array(vec![3], DType::Float32);
//! let traced = make_jaxpr(
//!     &registry,
//!     "f",
//!     &|t, xs| Ok(vec![t.mul(&t.sin(&xs[0])?, &xs[1])?]),
//!     &[x.clone(), x],
//! )?;
//! let split = partial_eval_jaxpr_custom(
//!     &registry,
//!     &traced.jaxpr,
//!     &[false, true],
//!     &[false, true],
//!     &[false],
//!     &[false],
//!     &SavePolicy::default(),
//! )?;
//! println!("{}\n{}", split.jaxpr_known, split.jaxpr_staged);
//! # Ok::<(), jaxpr_rs::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod array;
mod config;
mod dtype;
mod error;
mod shape;
pub mod trace;

// Public exports
pub use array::{Array, ArrayRef, Value};
pub use config::{Config, DEFAULT_CACHE_CAPACITY};
pub use dtype::DType;
pub use error::{Error, Result};
pub use shape::{Dim, Shape};
