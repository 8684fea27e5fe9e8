//! # Command-Line Interface
//!
//! User-facing CLI commands and output formatting.
//!
//! ## Commands
//!
//! | Command | Purpose |
//! |---------|---------|
//! | `init` | Create a `.unitwave/` workspace |
//! | `load` | Run a load session and persist the report |
//! | `plan` | Resolve and print the waves without running anything |
//! | `status` | Show the last persisted report |
//! | `errors` | Show recorded error contexts |
//! | `cache` | Inspect and maintain the metadata cache |
//!
//! ## Output Formats
//!
//! All commands support `--format` flag:
//! - `text` (default) - Human-readable output
//! - `json` - Machine-parseable JSON
//!
//! ## Verbose Mode
//!
//! `--verbose` (or `-v`) raises the log filter to `debug`. Without it the
//! filter comes from `RUST_LOG` and defaults to `warn`. Logs go to stderr:
//! ```bash
//! unitwave --verbose load
//! ```
//!
//! ## Entry Point
//!
//! Call [`run()`] to parse arguments and execute the appropriate command.

mod app;
mod cache_cmd;
mod errors_cmd;
mod load;
mod output;
mod plan;
mod status;

pub use app::{run, Cli, Commands};
pub use output::{Output, OutputFormat};
