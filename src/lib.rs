#[macro_use]
pub mod utils;

pub mod auth;
pub mod channel;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod keys;
pub mod logging;
pub mod pack;
pub mod plugins;
pub mod repository;
pub mod session;
pub mod ssh_key;
pub mod welcome;

// 导出主要结构和函数以便使用
pub use config::DaemonConfig;
pub use daemon::{SshDaemon, SshSession};
pub use logging::setup_logging;
pub use session::SshDaemonClient;
