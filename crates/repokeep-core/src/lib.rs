pub mod backup_tool;
pub mod block_storage;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod remote;
pub mod runner;
pub mod selector;
pub mod slot;
pub mod snapshot;
pub mod state;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use error::{RepokeepError, Result};
