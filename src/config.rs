//! Runtime settings.
//!
//! Settings come from an explicitly named TOML file, then environment
//! variables override individual fields:
//!
//! | Variable                  | Field                      |
//! |---------------------------|----------------------------|
//! | `SOPS_DECRYPTION_ORDER`   | `decryption_order` (comma separated key types) |
//! | `SOPS_ESCROW_MODE`        | `escrow_mode`              |
//! | `SOPS_KEYSERVICE_TIMEOUT` | `keyservice.timeout_secs`  |
//! | `SOPS_AGE_KEY_FILE`       | `age.key_file`             |
//!
//! ```toml
//! decryption_order = ["age", "pgp", "kms"]
//! escrow_mode = "group-quorum"
//!
//! [keyservice]
//! prompt = true
//! timeout_secs = 30
//!
//! [age]
//! key_file = "/etc/sops/keys.txt"
//! ```

use crate::error::{Result, SopsError};
use crate::escrow::{EscrowMode, DEFAULT_DECRYPTION_ORDER};
use crate::keys::KeyType;
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DECRYPTION_ORDER_ENV: &str = "SOPS_DECRYPTION_ORDER";
pub const ESCROW_MODE_ENV: &str = "SOPS_ESCROW_MODE";
pub const KEYSERVICE_TIMEOUT_ENV: &str = "SOPS_KEYSERVICE_TIMEOUT";

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    decryption_order: Option<Vec<String>>,
    #[serde(default)]
    escrow_mode: Option<EscrowMode>,
    #[serde(default)]
    keyservice: KeyServiceSettings,
    #[serde(default)]
    age: AgeSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KeyServiceSettings {
    /// Ask before every wrap/unwrap.
    #[serde(default)]
    pub prompt: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl KeyServiceSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AgeSettings {
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub decryption_order: Vec<KeyType>,
    pub escrow_mode: EscrowMode,
    pub keyservice: KeyServiceSettings,
    pub age: AgeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            decryption_order: DEFAULT_DECRYPTION_ORDER.to_vec(),
            escrow_mode: EscrowMode::default(),
            keyservice: KeyServiceSettings::default(),
            age: AgeSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => read_file(path)?,
            None => SettingsFile::default(),
        };

        let mut settings = Settings {
            keyservice: file.keyservice,
            age: file.age,
            ..Settings::default()
        };
        if let Some(order) = file.decryption_order {
            settings.decryption_order = parse_key_types(order.iter().map(String::as_str))?;
        }
        if let Some(mode) = file.escrow_mode {
            settings.escrow_mode = mode;
        }

        settings.apply_env()?;
        tracing::debug!(?settings, "settings loaded");
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(order) = env_var(DECRYPTION_ORDER_ENV) {
            self.decryption_order = parse_key_types(order.split(','))?;
        }
        if let Some(mode) = env_var(ESCROW_MODE_ENV) {
            self.escrow_mode = mode.parse()?;
        }
        if let Some(timeout) = env_var(KEYSERVICE_TIMEOUT_ENV) {
            let secs = timeout.trim().parse::<u64>().map_err(|_| {
                SopsError::Config(format!(
                    "{KEYSERVICE_TIMEOUT_ENV} must be a number of seconds, got {timeout:?}"
                ))
            })?;
            self.keyservice.timeout_secs = Some(secs);
        }
        if let Some(key_file) = env_var(crate::keys::age::SOPS_AGE_KEY_FILE_ENV) {
            self.age.key_file = Some(PathBuf::from(key_file));
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<SettingsFile> {
    let name = path
        .to_str()
        .ok_or_else(|| SopsError::Config("Invalid config path".into()))?;
    Config::builder()
        .add_source(File::new(name, FileFormat::Toml))
        .build()
        .and_then(|cfg| cfg.try_deserialize::<SettingsFile>())
        .map_err(|err| SopsError::Config(format!("Failed to load config file: {err}")))
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_key_types<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<KeyType>> {
    names
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| {
            n.parse::<KeyType>().map_err(|_| {
                SopsError::Config(format!("unknown key type {n:?} in decryption order"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn clear_env() {
        for var in [
            DECRYPTION_ORDER_ENV,
            ESCROW_MODE_ENV,
            KEYSERVICE_TIMEOUT_ENV,
            crate::keys::age::SOPS_AGE_KEY_FILE_ENV,
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_file_or_env() {
        clear_env();
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.decryption_order, vec![KeyType::Age, KeyType::Pgp]);
        assert_eq!(settings.keyservice.timeout(), None);
    }

    #[test]
    #[serial]
    fn test_reads_toml_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sops.toml");
        fs::write(
            &path,
            r#"
decryption_order = ["kms", "age"]
escrow_mode = "group-quorum"

[keyservice]
prompt = true
timeout_secs = 15

[age]
key_file = "/tmp/keys.txt"
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.decryption_order, vec![KeyType::Kms, KeyType::Age]);
        assert_eq!(settings.escrow_mode, EscrowMode::GroupQuorum);
        assert!(settings.keyservice.prompt);
        assert_eq!(settings.keyservice.timeout(), Some(Duration::from_secs(15)));
        assert_eq!(settings.age.key_file, Some(PathBuf::from("/tmp/keys.txt")));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sops.toml");
        fs::write(&path, "escrow_mode = \"strict\"\n").unwrap();

        env::set_var(DECRYPTION_ORDER_ENV, "pgp, hc_vault");
        env::set_var(ESCROW_MODE_ENV, "fail-fast");
        env::set_var(KEYSERVICE_TIMEOUT_ENV, "3");
        let settings = Settings::load(Some(&path));
        clear_env();

        let settings = settings.unwrap();
        assert_eq!(settings.decryption_order, vec![KeyType::Pgp, KeyType::HcVault]);
        assert_eq!(settings.escrow_mode, EscrowMode::FailFast);
        assert_eq!(settings.keyservice.timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_config_errors() {
        clear_env();
        env::set_var(DECRYPTION_ORDER_ENV, "age,yubikey");
        let result = Settings::load(None);
        clear_env();
        assert!(matches!(result, Err(SopsError::Config(_))));

        env::set_var(KEYSERVICE_TIMEOUT_ENV, "soon");
        let result = Settings::load(None);
        clear_env();
        assert!(matches!(result, Err(SopsError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_missing_file_is_an_error() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let result = Settings::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(SopsError::Config(_))));
    }
}
