//! Cloud key backends: identity parsing and the client seam.
//!
//! AWS KMS, GCP KMS, Azure Key Vault and Vault transit are reached through a
//! [`KmsClient`] registered on the local key service. The crate ships no
//! provider SDK; callers plug in a client per key type.

use crate::error::{Result, SopsError};
use crate::keyservice::KeyDescriptor;
use std::collections::BTreeMap;

/// Wraps and unwraps data keys with a remote key management service.
///
/// The wrapped form is the text stored in the document's `enc` field.
pub trait KmsClient: Send + Sync {
    fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<String>;
    fn decrypt(&self, key: &KeyDescriptor, ciphertext: &str) -> Result<Vec<u8>>;
}

/// Split `ARN[+ROLE_ARN]` into key ARN and role.
pub fn split_kms_arn(input: &str) -> (String, String) {
    let input = input.trim().replace(' ', "");
    match input.split_once('+') {
        Some((arn, role)) => (arn.to_string(), role.to_string()),
        None => (input, String::new()),
    }
}

/// Parse `key1:value1,key2:value2` into an encryption context.
pub fn parse_encryption_context(input: &str) -> Result<BTreeMap<String, String>> {
    let mut context = BTreeMap::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once(':').ok_or_else(|| {
            SopsError::InvalidMetadata(format!(
                "encryption context entry {pair:?} is not of the form key:value"
            ))
        })?;
        context.insert(key.to_string(), value.to_string());
    }
    Ok(context)
}

/// Parse an Azure Key Vault key URL into `(vault_url, name, version)`.
pub fn parse_azure_key_url(url: &str) -> Result<(String, String, String)> {
    let invalid = || {
        SopsError::InvalidMetadata(format!(
            "{url:?} is not of the form https://<vault>/keys/<name>/<version>"
        ))
    };
    let url = url.trim().trim_end_matches('/');
    let (vault_url, rest) = url.split_once("/keys/").ok_or_else(invalid)?;
    let (name, version) = rest.split_once('/').ok_or_else(invalid)?;
    if !vault_url.starts_with("https://") || name.is_empty() || version.contains('/') {
        return Err(invalid());
    }
    Ok((vault_url.to_string(), name.to_string(), version.to_string()))
}

/// Parse a Vault transit key URI into `(address, engine_path, key_name)`.
pub fn parse_vault_uri(uri: &str) -> Result<(String, String, String)> {
    let invalid = || {
        SopsError::InvalidMetadata(format!(
            "{uri:?} is not of the form https://<host>/v1/<engine path>/keys/<name>"
        ))
    };
    let uri = uri.trim().trim_end_matches('/');
    let scheme_end = uri.find("://").ok_or_else(invalid)? + 3;
    let path_start = uri[scheme_end..]
        .find('/')
        .map(|i| i + scheme_end)
        .ok_or_else(invalid)?;
    let (address, path) = uri.split_at(path_start);
    let path = path.strip_prefix("/v1/").ok_or_else(invalid)?;
    let (engine, name) = path.rsplit_once("/keys/").ok_or_else(invalid)?;
    if engine.is_empty() || name.is_empty() || name.contains('/') {
        return Err(invalid());
    }
    Ok((address.to_string(), engine.to_string(), name.to_string()))
}
