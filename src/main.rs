use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    floodgate::cli::parse_cli_commands().await
}
