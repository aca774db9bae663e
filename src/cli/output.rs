//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::PipelineError;

/// Map pipeline errors to a `kind: message` line for CLI output.
pub fn map_error(e: &PipelineError) -> String {
    format!("{}: {}", e.kind(), e)
}
