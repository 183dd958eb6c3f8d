//! Directory helpers following the XDG Base Directory specification
//!
//! - Config: `~/.config/sgfw/` - `config.json`
//! - State: `~/.local/state/sgfw/` - audit log, optional log file
//!
//! # Example
//!
//! ```no_run
//! use sgfw::utils::{ensure_dirs, get_state_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//! let audit = get_state_dir().map(|dir| dir.join("audit.log"));
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "sgfw", "sgfw")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700);
        builder.recursive(true);

        if let Some(dir) = get_config_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_config_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Creates the sgfw directories and returns `<state dir>/sgfw.log`.
///
/// # Errors
///
/// Returns `Err` if the directories cannot be created or there is no state
/// directory on this platform.
pub fn log_file_path() -> std::io::Result<PathBuf> {
    ensure_dirs()?;
    get_state_dir()
        .map(|dir| dir.join("sgfw.log"))
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found"))
}
