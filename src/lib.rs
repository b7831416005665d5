pub mod agent;
pub mod config;
pub mod control;
pub mod engine;
pub mod errors;
pub mod events;
pub mod git;
pub mod ids;
pub mod logging;
pub mod models;
pub mod plan;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod strategy;
pub mod stream;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Settings;
pub use control::Control;
pub use engine::Engine;
pub use store::{JsonStore, StoreHandle};
