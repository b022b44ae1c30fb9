//! Side effects attached to equations and graphs.
//!
//! Most effects are opaque tags. Input effects (`Read`, `Write`) name the
//! operand they touch by position, so they must be renumbered whenever the
//! binder list they index into changes.

use crate::trace::Var;
use std::collections::BTreeSet;
use std::fmt;

/// A single side effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Effect {
    /// Must happen in program order relative to other ordered effects.
    Ordered(String),
    /// May be reordered but not removed.
    Unordered(String),
    /// Collective over a named axis. Ignored by partial evaluation and DCE.
    NamedAxis(String),
    /// Reads the reference passed as the given operand.
    Read(usize),
    /// Writes the reference passed as the given operand.
    Write(usize),
    /// Allocates fresh mutable state. Local to the allocating graph.
    Alloc,
}

/// Ordered set of effects.
pub type Effects = BTreeSet<Effect>;

impl Effect {
    /// Operand index for input-indexed effects.
    pub fn input_index(&self) -> Option<usize> {
        match self {
            Effect::Read(i) | Effect::Write(i) => Some(*i),
            _ => None,
        }
    }

    /// Same effect kind pointing at another operand.
    pub fn with_input_index(&self, index: usize) -> Effect {
        match self {
            Effect::Read(_) => Effect::Read(index),
            Effect::Write(_) => Effect::Write(index),
            other => other.clone(),
        }
    }

    /// Whether partial evaluation must keep an equation with this effect alive.
    pub fn pins_equation(&self) -> bool {
        matches!(self, Effect::Ordered(_) | Effect::Unordered(_) | Effect::Write(_))
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Ordered(name) => write!(f, "Ordered({})", name),
            Effect::Unordered(name) => write!(f, "Unordered({})", name),
            Effect::NamedAxis(name) => write!(f, "NamedAxis({})", name),
            Effect::Read(i) => write!(f, "Read({})", i),
            Effect::Write(i) => write!(f, "Write({})", i),
            Effect::Alloc => write!(f, "Alloc"),
        }
    }
}

/// Effects relevant to partial evaluation (named-axis effects are ignored).
pub fn has_effects_for_partial_eval(effects: &Effects) -> bool {
    effects.iter().any(|e| !matches!(e, Effect::NamedAxis(_)))
}

/// Effects that keep an equation alive under DCE (reads and allocations are droppable).
pub fn has_effects_for_dce(effects: &Effects) -> bool {
    effects.iter().any(|e| !matches!(e, Effect::NamedAxis(_) | Effect::Read(_) | Effect::Alloc))
}

/// Returns true if any effect is input-indexed.
pub fn has_input_effects(effects: &Effects) -> bool {
    effects.iter().any(|e| e.input_index().is_some())
}

/// Re-index input effects from `old_binders` positions to `new_binders` positions.
///
/// Effects naming a binder that no longer exists are dropped.
pub fn renumber_effects(new_binders: &[Var], old_binders: &[Var], effects: &Effects) -> Effects {
    effects
        .iter()
        .filter_map(|effect| match effect.input_index() {
            None => Some(effect.clone()),
            Some(old) => {
                let var = old_binders.get(old)?;
                let new = new_binders.iter().position(|v| v == var)?;
                Some(effect.with_input_index(new))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::AbstractValue;
    use crate::DType;

    #[test]
    fn test_effect_filters() {
        let mut effects = Effects::new();
        effects.insert(Effect::NamedAxis("i".into()));
        assert!(!has_effects_for_partial_eval(&effects));
        assert!(!has_effects_for_dce(&effects));

        effects.insert(Effect::Read(0));
        assert!(has_effects_for_partial_eval(&effects));
        assert!(!has_effects_for_dce(&effects));
        assert!(has_input_effects(&effects));

        effects.insert(Effect::Ordered("io".into()));
        assert!(has_effects_for_dce(&effects));
    }

    #[test]
    fn test_renumber_effects() {
        let a = Var::new(AbstractValue::reference(vec![2], DType::Float32));
        let b = Var::new(AbstractValue::reference(vec![2], DType::Float32));
        let c = Var::new(AbstractValue::scalar(DType::Float32));
        let effects: Effects =
            [Effect::Read(0), Effect::Write(1), Effect::Ordered("io".into())].into_iter().collect();

        let moved = renumber_effects(&[c.clone(), b.clone(), a.clone()], &[a.clone(), b.clone()], &effects);
        assert!(moved.contains(&Effect::Read(2)));
        assert!(moved.contains(&Effect::Write(1)));
        assert!(moved.contains(&Effect::Ordered("io".into())));

        let dropped = renumber_effects(&[c, b], &[a.clone(), a], &effects);
        assert!(!dropped.iter().any(|e| e.input_index().is_some()));
    }
}
