pub mod agent;
pub mod bus;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod process;
pub mod resources;
pub mod store;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::Orchestrator;
pub use store::Store;
