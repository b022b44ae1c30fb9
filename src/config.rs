//! Runtime configuration for tracing and graph transformations.

use std::env;

/// Default per-table capacity of the transformation cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 2048;

/// Flags controlling checks and optional optimizations.
///
/// A `Config` is stored on the [`Registry`](crate::trace::Registry) and
/// therefore travels explicitly with every trace and transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Validate every graph produced by finalization, splitting and DCE.
    pub enable_checks: bool,
    /// Consult constant-folding rules when only some operands are known.
    pub eager_constant_folding: bool,
    /// Elide residuals that are identical to a known input or known output.
    pub forward_residuals: bool,
    /// Entries kept per memo table before the least recently used is evicted.
    /// Zero disables memoization.
    pub cache_capacity: usize,
}

impl Config {
    /// Read overrides from `JAXPR_ENABLE_CHECKS`, `JAXPR_EAGER_CONSTANT_FOLDING`,
    /// `JAXPR_FORWARD_RESIDUALS` and `JAXPR_CACHE_CAPACITY`, falling back to
    /// the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enable_checks: env_flag("JAXPR_ENABLE_CHECKS")
                .unwrap_or(defaults.enable_checks),
            eager_constant_folding: env_flag("JAXPR_EAGER_CONSTANT_FOLDING")
                .unwrap_or(defaults.eager_constant_folding),
            forward_residuals: env_flag("JAXPR_FORWARD_RESIDUALS")
                .unwrap_or(defaults.forward_residuals),
            cache_capacity: env_count("JAXPR_CACHE_CAPACITY")
                .unwrap_or(defaults.cache_capacity),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_checks: cfg!(debug_assertions),
            eager_constant_folding: true,
            forward_residuals: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("ignoring unrecognized value {:?} for {}", other, name);
            None
        }
    }
}

fn env_count(name: &str) -> Option<usize> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("ignoring non-numeric value {:?} for {}", value, name);
            None
        }
    }
}
