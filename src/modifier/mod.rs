//! Declarative flow modifiers: loading, precedence, and deterministic
//! application.

pub mod applier;
pub mod definition;
pub mod loader;

pub use applier::{AvailabilityChecker, FlowModifierApplier, StaticAvailability};
pub use definition::{ConflictSeverity, FlowModifierDef, ModifierAction, ModifierApplyResult, ModifierConflict, ModifierRequires};
pub use loader::{glob_match, FlowModifierLoader, ModifierLoadError, ModifierLoadReport};
