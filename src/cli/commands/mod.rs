//! CLI command implementations.

mod config;
mod init;
mod inspect;
mod start;

pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use init::{run_init, InitArgs};
pub use inspect::{run_inspect, InspectArgs, InspectCommand};
pub use start::{run_start, StartArgs};
