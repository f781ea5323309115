pub mod action;
pub mod autorun;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(windows)]
pub mod eventlog;
pub mod hyperv;
pub mod platform;
pub mod privilege;
pub mod state;
pub mod subscription;
pub mod utils;
