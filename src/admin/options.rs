use std::path::Path;

use crate::admin::Result;
use crate::db::SystemConfig;

/// Common options used when opening a database for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Engine settings.
    pub config: SystemConfig,
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            config: SystemConfig {
                background_index_load: false,
                ..SystemConfig::default()
            },
            create_if_missing: false,
        }
    }
}

impl AdminOpenOptions {
    /// Options with engine settings read from a TOML file. Admin commands
    /// never start the background index loader on their own.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = SystemConfig::from_toml_file(path)?;
        Ok(Self {
            config: SystemConfig {
                background_index_load: false,
                ..config
            },
            create_if_missing: false,
        })
    }

    /// Forces read-only opens.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }
}
