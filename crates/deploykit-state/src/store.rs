//! Persistence of deployment state files
//!
//! One YAML file per deployment, named `.test-state-<deployment_id>.yaml`.
//! No locking: a state file is only ever touched by one workflow at a time.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::StateError;
use crate::state::DeploymentState;

/// File name prefix shared by all state files
pub const STATE_FILE_PREFIX: &str = ".test-state-";

/// File name extension of state files
pub const STATE_FILE_EXT: &str = "yaml";

/// Default file name for a deployment
#[must_use]
pub fn state_file_name(deployment_id: &str) -> String {
    format!("{STATE_FILE_PREFIX}{deployment_id}.{STATE_FILE_EXT}")
}

fn is_state_file_name(name: &str) -> bool {
    name.starts_with(STATE_FILE_PREFIX)
        && name
            .strip_suffix(STATE_FILE_EXT)
            .is_some_and(|stem| stem.ends_with('.'))
}

/// Write the state as YAML
///
/// Without `path` the file is named from the deployment ID in the current
/// directory, so repeated saves overwrite the same file. Parent directories are
/// created as needed.
///
/// # Errors
/// Returns `StateError::Serialize` or `StateError::Io`
pub fn save(state: &DeploymentState, path: Option<&Path>) -> Result<PathBuf, StateError> {
    let path = path.map_or_else(
        || PathBuf::from(state_file_name(&state.deployment_id)),
        Path::to_path_buf,
    );

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }

    let content =
        serde_yaml::to_string(state).map_err(|e| StateError::Serialize(e.to_string()))?;
    std::fs::write(&path, content).map_err(|e| StateError::io(&path, e))?;

    debug!(path = %path.display(), "saved deployment state");
    Ok(path)
}

/// Save under `dir` with the default file name
///
/// # Errors
/// See [`save`]
pub fn save_in(state: &DeploymentState, dir: &Path) -> Result<PathBuf, StateError> {
    save(state, Some(&dir.join(state_file_name(&state.deployment_id))))
}

/// Read a state file
///
/// # Errors
/// `StateError::NotFound` if the path does not exist, `StateError::Parse` if
/// the content is not a valid state document
pub fn load(path: &Path) -> Result<DeploymentState, StateError> {
    if !path.exists() {
        return Err(StateError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|e| StateError::io(path, e))?;
    let state = serde_yaml::from_str(&content).map_err(|e| StateError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    debug!(path = %path.display(), "loaded deployment state");
    Ok(state)
}

/// Load every state file in `dir`, newest first
///
/// Files that fail to load are skipped with a warning. Each returned state
/// carries its file name in `source_file`.
///
/// # Errors
/// Returns `StateError::Io` only if the directory itself cannot be read
pub fn list_all(dir: &Path) -> Result<Vec<DeploymentState>, StateError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StateError::io(dir, e))?;

    let mut deployments = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !is_state_file_name(&file_name) {
            continue;
        }

        match load(&entry.path()) {
            Ok(mut state) => {
                state.source_file = Some(file_name);
                deployments.push(state);
            }
            Err(e) => {
                warn!(file = %file_name, error = %e, "failed to load state file");
            }
        }
    }

    deployments.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(deployments)
}

/// Remove a state file, reporting failure as `false`
#[must_use]
pub fn delete(path: &Path) -> bool {
    if !path.exists() {
        warn!(path = %path.display(), "state file not found");
        return false;
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "deleted state file");
            true
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to delete state file");
            false
        }
    }
}
