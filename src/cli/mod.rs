//! # CLI Module
//!
//! Command-line interface for the Floodgate gateway.
//!
//! ## Commands
//!
//! - `start`: Validate the environment and run the gateway
//! - `validate-env`: Validate the environment and print the resolved configuration
//! - `env-example`: Print an example `.env` file with every supported variable
//!
//! ## Usage Example
//!
//! ```bash
//! # Check configuration before deploying
//! FLOODGATE_RATE_LIMIT_REQUESTS=120 floodgate validate-env
//!
//! # Generate a starting .env
//! floodgate env-example > .env
//!
//! # Start the gateway
//! FLOODGATE_UPSTREAM_URL=http://inference:9000 floodgate start
//! ```

use crate::env::{generate_env_example, print_validation_results, validate_environment};
use crate::logging::init_tracing;
use crate::server::start_server;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::error;

///////////////////////////////////////////////////////////////////////////////
//****                        Private Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Parser)]
#[command(name = "floodgate")]
#[command(about = "Floodgate admission-control gateway: rate limiting and request deduplication")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

///////////////////////////////////////////////////////////////////////////////
//****                         Private Types                             ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start,
    /// Validate environment variables and print the resolved configuration
    #[command(name = "validate-env")]
    ValidateEnv,
    /// Print an example environment file
    #[command(name = "env-example")]
    EnvExample,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Parse the process arguments and run the selected command
pub async fn parse_cli_commands() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = match validate_environment() {
                Ok(config) => config,
                Err(errors) => {
                    print_validation_results(&Err(errors));
                    return ExitCode::FAILURE;
                }
            };

            init_tracing(Some(&config.log_level));
            match start_server(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::ValidateEnv => {
            let result = validate_environment();
            print_validation_results(&result);
            if result.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::EnvExample => {
            print!("{}", generate_env_example());
            ExitCode::SUCCESS
        }
    }
}
