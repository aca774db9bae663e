//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Later sources override earlier ones key by key; tables merge, arrays replace.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("storage.store_path", ".docforge/store")?
        .set_default("storage.blob_path", ".docforge/blobs")?
        .set_default("pipeline.workspace_dir", ".docforge/workspaces")?
        .set_default("logging.level", "info")
}
