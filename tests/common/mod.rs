use age::secrecy::ExposeSecret;
use assert_cmd::{cargo::cargo_bin_cmd, Command};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A freshly generated x25519 identity.
pub struct AgeIdentity {
    pub recipient: String,
    pub secret: String,
}

pub fn age_identity() -> AgeIdentity {
    let identity = age::x25519::Identity::generate();
    AgeIdentity {
        recipient: identity.to_public().to_string(),
        secret: identity.to_string().expose_secret().to_string(),
    }
}

/// Temporary directory doubling as `HOME`, so no user keys leak into tests.
#[allow(dead_code)]
pub fn workspace() -> TempDir {
    TempDir::new().expect("failed to create temp dir")
}

#[allow(dead_code)]
pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("failed to write test file");
    path
}

/// The sops binary with an isolated environment. `secret` becomes the only
/// age identity it can use.
#[allow(dead_code)]
pub fn sops_cmd(home: &Path, secret: Option<&str>) -> Command {
    let mut cmd = cargo_bin_cmd!("sops");
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("SOPS_AGE_KEY_FILE")
        .env_remove("SOPS_AGE_SSH_PRIVATE_KEY_FILE")
        .env_remove("SOPS_DECRYPTION_ORDER")
        .env_remove("SOPS_ESCROW_MODE")
        .env_remove("SOPS_KEYSERVICE_TIMEOUT")
        .env_remove("SOPS_LOG");
    match secret {
        Some(secret) => cmd.env("SOPS_AGE_KEY", secret),
        None => cmd.env_remove("SOPS_AGE_KEY"),
    };
    cmd
}
