pub mod build_info;
pub mod cgroup;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod fsys;
pub mod logging;
pub mod monitor;
pub mod monitor_cli;
pub mod output;
pub mod pidfile;
pub mod process;
pub mod status;
pub mod supervisor;
