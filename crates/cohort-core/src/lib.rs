//! cohort/crates/cohort-core/src/lib.rs
//!
//! The domain model and port definitions for the weekly cohort engine.

pub mod calendar;
pub mod error;
pub mod models;
pub mod rules;
pub mod traits;

// Re-exporting for easier access in other crates
pub use calendar::*;
pub use error::*;
pub use models::*;
pub use rules::*;
pub use traits::*;
