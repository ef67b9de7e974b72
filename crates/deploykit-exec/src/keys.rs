//! SSH key resolution and loading

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{PrivateKey, load_secret_key};
use tracing::{debug, warn};

use crate::error::ExecError;

/// Expand a leading `~/` against the home directory
#[must_use]
pub fn expand_key_path(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}

/// Load the private key for one call
///
/// # Errors
/// Returns `ExecError::Credential` if the file is missing or cannot be parsed
pub fn load_private_key(path: &Path) -> Result<Arc<PrivateKey>, ExecError> {
    let path = expand_key_path(path);

    if !path.exists() {
        return Err(ExecError::Credential(format!(
            "SSH key not found: {}",
            path.display()
        )));
    }

    warn_on_open_permissions(&path);

    let key = load_secret_key(&path, None).map_err(|e| {
        ExecError::Credential(format!(
            "failed to load SSH key from {}: {e}",
            path.display()
        ))
    })?;

    debug!(path = %path.display(), algorithm = %key.algorithm(), "loaded SSH key");

    Ok(Arc::new(key))
}

#[cfg(unix)]
fn warn_on_open_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    // group/other bits
    if metadata.permissions().mode() & 0o77 != 0 {
        warn!(path = %path.display(), "key file permissions too open (should be 600)");
    }
}

#[cfg(not(unix))]
fn warn_on_open_permissions(_path: &Path) {}
