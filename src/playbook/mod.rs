//! Recorded purchase flows: the action vocabulary, versioned storage and
//! strict in-order replay.

pub mod actions;
pub mod replay;
pub mod store;

pub use actions::{Action, TemplateVars};
pub use replay::{replay, ReplayReport};
pub use store::{Playbook, PlaybookStore};
