pub mod config;
pub mod init;
pub mod plan;
pub mod run;
pub mod slot;
pub mod state;
