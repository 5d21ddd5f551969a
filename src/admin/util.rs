use std::fs;
use std::path::Path;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;
use crate::db::Database;

/// Opens the database at `path` with the admin options.
///
/// # Errors
///
/// Returns an error if the database doesn't exist and `create_if_missing` is false,
/// or if opening it fails.
pub fn open_database(path: &Path, opts: &AdminOpenOptions) -> Result<Database> {
    if !path.exists() {
        if !opts.create_if_missing || opts.config.read_only {
            return Err(AdminError::missing_database(path));
        }
        ensure_parent_dir(path)?;
    }
    Ok(Database::open(path, opts.config.clone())?)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
