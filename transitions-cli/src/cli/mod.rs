//! CLI command handling

pub mod builtin_actions;
pub mod handlers;
