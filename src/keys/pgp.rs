#[cfg(feature = "gpg")]
use pgp::{
    composed::{
        ArmorOptions, Deserializable, MessageBuilder, SignedPublicKey, SignedPublicSubKey,
    },
    crypto::sym::SymmetricKeyAlgorithm,
    errors::Error as PgpError,
    packet::{KeyFlags, PublicKey, PublicSubkey},
};
#[cfg(feature = "gpg")]
use rand::rngs::OsRng;

use crate::error::{Result, SopsError};
use std::io::Write;
use std::process::{Command, Stdio};

/// Overrides the GnuPG binary used for wrapping and unwrapping.
pub const SOPS_GPG_EXEC_ENV: &str = "SOPS_GPG_EXEC";

pub fn gpg_binary() -> String {
    std::env::var(SOPS_GPG_EXEC_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "gpg".to_string())
}

/// Encrypt a data key to an armored public key using rPGP.
#[cfg(feature = "gpg")]
pub fn wrap_with_public_key(armored_public_key: &str, data_key: &[u8]) -> Result<String> {
    let (signed_key, _headers) =
        SignedPublicKey::from_string(armored_public_key).map_err(map_pgp_err)?;
    let recipient = select_recipient_key(&signed_key).ok_or_else(|| {
        SopsError::Gpg("No encryption-capable keys found in the public key".into())
    })?;

    let mut rng = OsRng;
    let mut builder = MessageBuilder::from_bytes("", data_key.to_vec())
        .seipd_v1(&mut rng, SymmetricKeyAlgorithm::AES256);

    match recipient {
        RecipientKey::Primary(pk) => builder.encrypt_to_key(&mut rng, pk),
        RecipientKey::Subkey(subkey) => builder.encrypt_to_key(&mut rng, subkey),
    }
    .map_err(map_pgp_err)?;

    builder
        .to_armored_string(&mut rng, ArmorOptions::default())
        .map_err(map_pgp_err)
}

#[cfg(not(feature = "gpg"))]
pub fn wrap_with_public_key(_armored_public_key: &str, _data_key: &[u8]) -> Result<String> {
    Err(SopsError::Gpg(
        "In-process PGP support not enabled. Rebuild with --features gpg".into(),
    ))
}

/// Encrypt a data key for `fingerprint` with the GnuPG binary.
pub fn wrap_with_gpg(fingerprint: &str, data_key: &[u8]) -> Result<String> {
    if fingerprint.is_empty() || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SopsError::Gpg(format!(
            "{fingerprint:?} is not a hexadecimal key fingerprint"
        )));
    }
    let trusted = &fingerprint[fingerprint.len().saturating_sub(16)..];
    let output = run_gpg(
        &[
            "--no-default-recipient",
            "--yes",
            "--encrypt",
            "-a",
            "-r",
            fingerprint,
            "--trusted-key",
            trusted,
            "--no-encrypt-to",
        ],
        data_key,
    )?;
    String::from_utf8(output).map_err(|e| SopsError::Gpg(e.to_string()))
}

/// Decrypt an armored data key with the GnuPG binary and its agent.
pub fn unwrap_with_gpg(armored: &str) -> Result<Vec<u8>> {
    run_gpg(&["--use-agent", "-d"], armored.as_bytes())
}

fn run_gpg(args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
    let binary = gpg_binary();
    let mut child = Command::new(&binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SopsError::Gpg(format!("failed to run {binary}: {e}")))?;

    // Dropping stdin closes the pipe before waiting.
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(input),
        None => Ok(()),
    };
    let output = child.wait_with_output()?;
    written?;
    if !output.status.success() {
        return Err(SopsError::Gpg(format!(
            "{binary} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

#[cfg(feature = "gpg")]
enum RecipientKey<'a> {
    Primary(&'a PublicKey),
    Subkey(&'a PublicSubkey),
}

#[cfg(feature = "gpg")]
fn select_recipient_key(signed_key: &SignedPublicKey) -> Option<RecipientKey<'_>> {
    signed_key
        .public_subkeys
        .iter()
        .find(|subkey| subkey_supports_encryption(subkey))
        .map(|subkey| RecipientKey::Subkey(&subkey.key))
        .or(Some(RecipientKey::Primary(&signed_key.primary_key)))
}

#[cfg(feature = "gpg")]
fn subkey_supports_encryption(subkey: &SignedPublicSubKey) -> bool {
    subkey
        .signatures
        .iter()
        .any(|sig| key_flags_allow_encryption(&sig.key_flags()))
}

#[cfg(feature = "gpg")]
fn key_flags_allow_encryption(flags: &KeyFlags) -> bool {
    flags.encrypt_comms() || flags.encrypt_storage()
}

#[cfg(feature = "gpg")]
fn map_pgp_err(err: PgpError) -> SopsError {
    SopsError::Gpg(err.to_string())
}
