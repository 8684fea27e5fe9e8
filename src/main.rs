//! unitwave - wave-parallel loading of shell units

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = unitwave::cli::run() {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
