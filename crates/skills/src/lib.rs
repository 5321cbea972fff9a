//! Agent-authored, persisted procedures with cached semantic search.

pub mod library;
pub mod validate;

pub use library::SkillLibrary;
pub use validate::{validate_skill, validate_source};
