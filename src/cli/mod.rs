#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

mod args;
mod commands;
mod output;

pub use args::{suggest_commands, Cli, Command, COMMAND_NAMES};
pub use commands::run_command;
pub use output::{error_envelope, success_envelope, usage_error_envelope};
