use lib::cli::interface::run_cli_interface;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match run_cli_interface().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(2)
        }
    }
}
