//! nftables rendering and the live sink
//!
//! [`render_tables`] turns a staged [`TableSet`] into one `nft --json` batch:
//! each populated table is recreated from scratch (`add`, `delete`, `add`),
//! then every chain is declared, then every rule is added in chain order.
//! `nft` applies a batch as a single transaction, so the swap from one
//! generation to the next is atomic.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::error::{Error, Result};
use crate::core::model::IpVersion;
use crate::core::sink::{BASE_CHAIN, FilterSink, RuleTable, StagedTables, TableSet};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::process::Stdio;
use tracing::{error, info};
use uuid::Uuid;

/// Renders the populated tables as one nftables JSON batch.
pub fn render_tables(tables: &TableSet, table_name: &str) -> Value {
    let mut nft_rules = vec![json!({ "metainfo": { "json_schema_version": 1 } })];

    for (version, table) in tables.populated() {
        let family = version.family();
        let table_ref = json!({ "table": { "family": family, "name": table_name } });

        // 1. Recreate the table so chains dropped since the last commit go away
        nft_rules.push(json!({ "add": table_ref }));
        nft_rules.push(json!({ "delete": table_ref }));
        nft_rules.push(json!({ "add": table_ref }));

        // 2. Chains
        for (name, _) in table.chains() {
            nft_rules.push(chain_json(family, table_name, name));
        }

        // 3. Rules
        for (name, rules) in table.chains() {
            for rule in rules {
                nft_rules.push(json!({
                    "add": {
                        "rule": {
                            "family": family,
                            "table": table_name,
                            "chain": name,
                            "expr": rule.to_nft_exprs()
                        }
                    }
                }));
            }
        }
    }

    json!({ "nftables": nft_rules })
}

fn chain_json(family: &str, table_name: &str, name: &str) -> Value {
    if name == BASE_CHAIN {
        json!({
            "add": {
                "chain": {
                    "family": family,
                    "table": table_name,
                    "name": name,
                    "type": "filter",
                    "hook": "forward",
                    "prio": 0,
                    "policy": "accept"
                }
            }
        })
    } else {
        json!({ "add": { "chain": { "family": family, "table": table_name, "name": name } } })
    }
}

/// Renders the populated tables in `nft list ruleset` style.
pub fn render_text(tables: &TableSet, table_name: &str) -> String {
    let mut out = String::new();
    for (version, table) in tables.populated() {
        write_table_text(&mut out, version, table, table_name);
    }
    out
}

fn write_table_text(out: &mut String, version: IpVersion, table: &RuleTable, table_name: &str) {
    use std::fmt::Write;

    let _ = writeln!(out, "table {} {table_name} {{", version.family());
    for (name, rules) in table.chains() {
        let _ = writeln!(out, "    chain {name} {{");
        if name == BASE_CHAIN {
            let _ = writeln!(out, "        type filter hook forward priority 0; policy accept;");
        }
        for rule in rules {
            let _ = writeln!(out, "        {rule}");
        }
        let _ = writeln!(out, "    }}");
    }
    let _ = writeln!(out, "}}");
}

/// Computes SHA-256 checksum of a JSON value.
///
/// The checksum is computed on the canonical JSON string representation.
pub fn compute_checksum(payload: &Value) -> String {
    let json_str = serde_json::to_string(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json_str.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Applies a batch with `nft --json -f -`.
///
/// # Errors
///
/// Returns [`Error::Nftables`] with `nft`'s stderr and exit code if the batch
/// is rejected, or `Err` if `nft` cannot be run at all.
pub fn apply_payload(payload: &Value) -> Result<()> {
    let json_string = serde_json::to_string(payload)?;

    let mut child = crate::elevation::create_elevated_nft_command(&["--json", "-f", "-"])
        .map_err(|e| Error::Internal(format!("Privilege escalation unavailable: {e}")))?
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn elevated nft: {e}");
            Error::Internal(format!("Failed to spawn elevated nft: {e}"))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(json_string.as_bytes())?;
    }

    let output = child.wait_with_output()?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        error!("nft apply failed: {stderr}");
        Err(Error::Nftables {
            message: crate::core::verify::parse_nft_errors(&stderr).join("; "),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

/// Sink that pushes every commit to the kernel through `nft`
#[derive(Debug)]
pub struct NftablesSink {
    staging: StagedTables,
    table_name: String,
    verify: bool,
    audit: Option<AuditLog>,
}

impl NftablesSink {
    pub fn new(table_name: impl Into<String>, verify: bool) -> Self {
        Self {
            staging: StagedTables::default(),
            table_name: table_name.into(),
            verify,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    fn record(&self, commit_id: Uuid, event_type: EventType, details: Value, error: Option<String>) {
        if let Some(audit) = &self.audit {
            audit.record(&AuditEvent::new(
                commit_id,
                event_type,
                error.is_none(),
                details,
                error,
            ));
        }
    }
}

impl FilterSink for NftablesSink {
    fn staging(&self) -> &StagedTables {
        &self.staging
    }

    fn staging_mut(&mut self) -> &mut StagedTables {
        &mut self.staging
    }

    fn push(&mut self, tables: &TableSet) -> Result<()> {
        let payload = render_tables(tables, &self.table_name);
        let commit_id = Uuid::new_v4();
        let checksum = compute_checksum(&payload);
        let details = json!({
            "table": self.table_name,
            "checksum": checksum,
            "ipv4_chains": tables.ipv4.chains().count(),
            "ipv6_chains": tables.ipv6.chains().count(),
        });

        if self.verify {
            let result = crate::core::verify::verify_payload(&payload)?;
            if !result.success {
                let message = result.errors.join("; ");
                self.record(commit_id, EventType::VerifyRules, details, Some(message.clone()));
                return Err(Error::Nftables {
                    message,
                    stderr: None,
                    exit_code: None,
                });
            }
            self.record(commit_id, EventType::VerifyRules, details.clone(), None);
        }

        match apply_payload(&payload) {
            Ok(()) => {
                info!(%commit_id, %checksum, "Committed nftables batch");
                self.record(commit_id, EventType::CommitRules, details, None);
                Ok(())
            }
            Err(e) => {
                self.record(commit_id, EventType::CommitRules, details, Some(e.to_string()));
                Err(e)
            }
        }
    }
}
