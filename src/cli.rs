//! CLI domain: parse, route, output, and presentation only.
//! No domain orchestration; a single route table dispatches to the pipeline.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, OutputFormat};
pub use presentation::{
    format_attempt_history, format_batch_text, format_history_text, format_reconcile_text,
    format_response_text,
};
pub use route::RunContext;
