use segfetch_core::logging;

mod cli;

use crate::cli::CliCommand;

#[tokio::main]
async fn main() {
    // Initialize logging as early as possible. A file-backed logger can fail
    // (read-only state dir, no $HOME); fall back to stderr rather than abort.
    if let Err(err) = logging::init_logging() {
        eprintln!("segfetch: could not initialize file logging ({err:#}), falling back to stderr");
        logging::init_logging_stderr();
    }

    // Parse CLI and dispatch.
    if let Err(err) = CliCommand::run_from_args().await {
        eprintln!("segfetch error: {:#}", err);
        std::process::exit(1);
    }
}

