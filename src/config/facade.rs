//! Loader facade: builds the layered configuration for a workspace.

use super::merge::merge_policy::builder_with_defaults;
use super::sources::{global_file, workspace_file};
use super::ForgeConfig;
use crate::error::PipelineError;
use config::{Environment, File};
use std::path::{Path, PathBuf};

/// Environment prefix; `DOCFORGE__PIPELINE__MAX_RETRIES=5` sets `pipeline.max_retries`.
const ENV_PREFIX: &str = "DOCFORGE";
const ENV_SEPARATOR: &str = "__";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load defaults, global file, workspace files and environment, in that order.
    pub fn load(workspace_root: &Path) -> Result<ForgeConfig, PipelineError> {
        let builder = builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load a single file on top of the defaults.
    pub fn load_from_file(path: &Path) -> Result<ForgeConfig, PipelineError> {
        let config = builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load and validate, folding validation errors into one `ConfigError`.
    pub fn load_validated(
        workspace_root: &Path,
        explicit: Option<&Path>,
    ) -> Result<ForgeConfig, PipelineError> {
        let config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load(workspace_root)?,
        };
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            PipelineError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        Ok(config)
    }

    pub fn global_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }
}
