/// Verification of nftables batches
///
/// Every batch can be dry-run through `nft --json --check` before it is
/// applied, so a malformed generation is rejected without touching the live
/// tables.
use crate::core::error::{Error, Result};
use std::io::Write;
use std::process::Stdio;
use tracing::{info, warn};

/// Result of a batch verification
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl VerifyResult {
    pub fn success() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
        }
    }
}

/// Runs `nft --json --check -f -` on a payload.
///
/// # Errors
///
/// Returns `Err` if `nft` cannot be spawned or fed. A payload that `nft`
/// rejects is `Ok` with a failed [`VerifyResult`].
pub fn verify_payload(json_payload: &serde_json::Value) -> Result<VerifyResult> {
    let json_string = serde_json::to_string(json_payload)?;

    info!("Verifying batch via nft --json --check");

    let mut child = crate::elevation::create_elevated_nft_command(&["--json", "--check", "-f", "-"])
        .map_err(|e| Error::Internal(format!("Privilege escalation unavailable: {e}")))?
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Internal(format!("Failed to spawn nft: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(json_string.as_bytes())
            .map_err(|e| Error::Internal(format!("Failed to write to nft stdin: {e}")))?;
    }

    let output = child.wait_with_output()?;

    if output.status.success() {
        info!("Batch verification passed");
        Ok(VerifyResult::success())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Batch verification failed: {}", stderr);
        Ok(VerifyResult::failure(parse_nft_errors(&stderr)))
    }
}

/// Parses nft error output into one message per error
///
/// Understands the JSON error format and falls back to plain stderr lines.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<serde_json::Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}
