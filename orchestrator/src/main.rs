use std::process::ExitCode;

use log::error;
use orchestrator::{LaunchConfig, launch};

fn main() -> ExitCode {
    env_logger::init();

    let result = LaunchConfig::from_env()
        .and_then(|cfg| launch(&cfg))
        .and_then(|session| session.wait());

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
