use crate::core::error::{Error, Result};
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which driver the host runs with
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DriverKind {
    /// Compile policy into nftables chains
    #[default]
    Nftables,
    /// Filter nothing
    Noop,
}

/// Process-wide firewall configuration
///
/// Read once at start-up and handed by value to the compiler and managers;
/// nothing reads it from global state afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Generate and apply IPv6 rules
    #[serde(default = "default_true")]
    pub enable_ipv6: bool,
    /// Accept everything sourced from the entity's own subnets
    #[serde(default = "default_true")]
    pub allow_same_network_traffic: bool,
    #[serde(default)]
    pub driver: DriverKind,
    /// Name of the `ip`/`ip6` tables this host owns
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Run `nft --check` on every batch before applying it
    #[serde(default = "default_true")]
    pub verify_before_apply: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enable_ipv6: true,
            allow_same_network_traffic: true,
            driver: DriverKind::default(),
            table_name: default_table_name(),
            verify_before_apply: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_table_name() -> String {
    "sgfw".to_string()
}

impl FirewallConfig {
    /// Checks values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the table name is not a safe identifier.
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_table_name(&self.table_name).map_err(|message| {
            Error::Validation {
                field: "table_name".to_string(),
                message,
            }
        })
    }

    /// Applies one `key=value` assignment, as given to `sgfw config --set`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unknown key, a malformed
    /// assignment, or a value that does not parse for its key. The config is
    /// left unchanged on error.
    pub fn set(&mut self, assignment: &str) -> Result<()> {
        let invalid = |field: &str, message: String| Error::Validation {
            field: field.to_string(),
            message,
        };
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| invalid("config", format!("expected KEY=VALUE, got '{assignment}'")))?;
        let (key, value) = (key.trim(), value.trim());
        let flag = |value: &str| {
            value
                .parse::<bool>()
                .map_err(|_| invalid(key, format!("expected true or false, got '{value}'")))
        };

        let mut next = self.clone();
        match key {
            "enable_ipv6" => next.enable_ipv6 = flag(value)?,
            "allow_same_network_traffic" => next.allow_same_network_traffic = flag(value)?,
            "verify_before_apply" => next.verify_before_apply = flag(value)?,
            "driver" => {
                next.driver = value
                    .parse()
                    .map_err(|_| invalid(key, format!("unknown driver '{value}'")))?;
            }
            "table_name" => next.table_name = value.to_string(),
            _ => return Err(invalid("config", format!("unknown key '{key}'"))),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Default config location: `<XDG config dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &FirewallConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
        .await
        .map_err(|e| Error::Internal(format!("Config writer task failed: {e}")))??;
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Loads the config, or returns the defaults if the file does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read, is not valid JSON, or
/// fails [`FirewallConfig::validate`].
pub async fn load_config(path: &Path) -> Result<FirewallConfig> {
    let config = match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<FirewallConfig>(&json)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            FirewallConfig::default()
        }
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FirewallConfig::default();
        assert!(config.enable_ipv6);
        assert!(config.allow_same_network_traffic);
        assert_eq!(config.driver, DriverKind::Nftables);
        assert_eq!(config.table_name, "sgfw");
        assert!(config.verify_before_apply);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: FirewallConfig =
            serde_json::from_str(r#"{"enable_ipv6": false, "driver": "noop"}"#).unwrap();
        assert!(!config.enable_ipv6);
        assert!(config.allow_same_network_traffic);
        assert_eq!(config.driver, DriverKind::Noop);
        assert_eq!(config.table_name, "sgfw");
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("NOOP".parse::<DriverKind>().unwrap(), DriverKind::Noop);
        assert_eq!(DriverKind::Nftables.to_string(), "nftables");
    }

    #[test]
    fn test_validate_rejects_bad_table_name() {
        let config = FirewallConfig {
            table_name: "bad name".to_string(),
            ..FirewallConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_set_assignments() {
        let mut config = FirewallConfig::default();
        config.set("enable_ipv6=false").unwrap();
        config.set("driver = NOOP").unwrap();
        config.set("table_name=edge").unwrap();
        assert!(!config.enable_ipv6);
        assert_eq!(config.driver, DriverKind::Noop);
        assert_eq!(config.table_name, "edge");

        for bad in ["enable_ipv6", "enable_ipv6=yes", "driver=iptables", "colour=red", "table_name=bad name"] {
            assert!(
                matches!(config.set(bad), Err(Error::Validation { .. })),
                "{bad} was accepted"
            );
        }
        assert_eq!(config.table_name, "edge");
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = FirewallConfig {
            allow_same_network_traffic: false,
            table_name: "edge".to_string(),
            ..FirewallConfig::default()
        };

        save_config(&config, &path).await.unwrap();
        assert_eq!(load_config(&path).await.unwrap(), config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config, FirewallConfig::default());
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_config(&path).await,
            Err(Error::Serialization(_))
        ));
    }
}
