//! Transition engine: registry, definitions, execution and run tracking

pub mod awaiter;
pub mod command_action;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod loader;
pub mod locks;
pub mod permission;
pub mod persistence;
pub mod registry;
pub mod state_store;
pub mod store;
pub mod validator;

pub use awaiter::*;
pub use command_action::*;
pub use dispatcher::*;
pub use error::*;
pub use events::*;
pub use executor::*;
pub use loader::*;
pub use locks::*;
pub use permission::*;
pub use persistence::*;
pub use registry::*;
pub use state_store::*;
pub use store::*;
pub use validator::*;
