use segpipe_core::logging;

mod cli;

use crate::cli::CliCommand;

#[tokio::main]
async fn main() {
    // A read-only state dir must not keep the CLI from running.
    if logging::init_logging().is_err() {
        logging::init_logging_stderr();
    }

    if let Err(err) = CliCommand::run_from_args().await {
        eprintln!("segpipe error: {:#}", err);
        std::process::exit(1);
    }
}
