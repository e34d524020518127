//! Shared types for the EDU-CORE notification platform

pub mod types;

pub use types::*;
