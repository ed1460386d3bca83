//! Per-user script hosting: workspaces on disk, dependency installation,
//! supervised child processes and a multi-step upload flow, served over HTTP.

#[cfg(not(unix))]
compile_error!("scripthost only works on Unix.");

pub mod config;
pub mod http_server;
pub mod installer;
pub mod interpreter;
pub mod registry;
pub mod state;
pub mod upload;
pub mod workspace;
