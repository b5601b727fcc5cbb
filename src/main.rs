#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use buildloop::cli::{
    error_envelope, run_command, success_envelope, suggest_commands, usage_error_envelope, Cli,
};
use buildloop::config::load_config;
use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const USAGE_EXIT_CODE: i32 = 2;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => std::process::exit(report_parse_error(&error)),
    };
    let command = cli.command.name();

    let config = match load_config(cli.config).await {
        Ok(mut config) => {
            if cli.database_url.is_some() {
                config.database_url = cli.database_url;
            }
            config
        }
        Err(error) => {
            print_json(&error_envelope(command, &error));
            std::process::exit(error.exit_code());
        }
    };
    init_tracing(&config.log_filter);

    match run_command(&cli.command, config).await {
        Ok(payload) => print_json(&success_envelope(command, payload)),
        Err(error) => {
            tracing::error!(%error, code = error.code(), "command failed");
            print_json(&error_envelope(command, &error));
            std::process::exit(error.exit_code());
        }
    }
}

/// `RUST_LOG` wins over the configured filter. Logs go to stderr so stdout
/// stays machine-readable.
fn init_tracing(config_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report_parse_error(error: &clap::Error) -> i32 {
    if matches!(
        error.kind(),
        ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
    ) {
        let _ = error.print();
        return if error.kind() == ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand {
            USAGE_EXIT_CODE
        } else {
            0
        };
    }

    let suggestions = match error.get(ContextKind::InvalidSubcommand) {
        Some(ContextValue::String(typo)) => suggest_commands(typo),
        _ => Vec::new(),
    };
    let message = error.kind().as_str().map_or_else(
        || error.to_string().lines().next().unwrap_or_default().to_string(),
        str::to_string,
    );
    print_json(&usage_error_envelope(&message, &suggestions));
    USAGE_EXIT_CODE
}

fn print_json(value: &Value) {
    println!("{value}");
}
