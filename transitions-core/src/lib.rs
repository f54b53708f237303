//! # Transitions Core Library
//!
//! State transition engine for object lifecycles: actions are registered once,
//! transitions are declared per object kind, and runs move objects from
//! source states to a target state through an ordered action chain.

pub mod models;
pub mod services;
pub mod transitions;
