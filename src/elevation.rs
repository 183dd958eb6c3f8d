//! Privilege elevation for `nft`
//!
//! sgfw usually runs as root under the host's supervisor, in which case `nft`
//! is executed directly. Run interactively as an unprivileged user (the CLI
//! `apply` command), it elevates through `run0` or `sudo`.
//!
//! # Environment Variables
//!
//! - `SGFW_NFT_COMMAND`: Program to run instead of `nft` (tests, wrappers).
//! - `SGFW_ELEVATION_METHOD`: Force a specific elevation method (`sudo` or
//!   `run0`).
//! - `SGFW_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only `nft` can be elevated
//! - Commands are constructed without shell interpolation

use std::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `SGFW_ELEVATION_METHOD`
    #[error("Invalid SGFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0")]
    InvalidMethod(String),

    /// Not root and no usable elevation method
    #[error("Not running as root and neither run0 nor sudo is available")]
    NoElevation,
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(method: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(method);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("SGFW_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Direct Root Execution
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("SGFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty && binary_exists("sudo") {
        return Ok(wrapped("sudo", program, args));
    }

    Err(ElevationError::NoElevation)
}

/// Creates an elevated `nft` command with the specified arguments
///
/// # Errors
///
/// Returns `Err` if elevation is needed but no method is usable.
///
/// # Example
///
/// ```no_run
/// use sgfw::elevation::create_elevated_nft_command;
///
/// let mut cmd = create_elevated_nft_command(&["--json", "list", "ruleset"])?;
/// let output = cmd.output()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    let program = std::env::var("SGFW_NFT_COMMAND").unwrap_or_else(|_| "nft".to_string());
    build_elevated_command(&program, args)
}
