//! Data models for the transition engine

pub mod configuration;
pub mod transition;

pub use configuration::*;
pub use transition::*;
