//! # Stores
//!
//! A store turns file bytes into document branches and back. Encrypted
//! documents carry their metadata under the top-level `sops` key in the
//! wire shape defined here; the stores only deal with the surrounding
//! document format.
//!
//! Wire metadata field order is fixed so that re-encrypting a document
//! produces minimal diffs.

pub mod binary;
pub mod json;

use crate::error::{Result, SopsError};
use crate::keys::{AgeKey, AzureKvKey, GcpKmsKey, KmsKey, MasterKey, PgpKey, VaultKey};
use crate::metadata::{format_timestamp, parse_timestamp, CryptRule, KeyGroup, Metadata};
use crate::tree::{Tree, TreeBranch, Value};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::Path;

pub use binary::BinaryStore;
pub use json::JsonStore;

pub trait Store {
    fn load_plain_file(&self, input: &[u8]) -> Result<Vec<TreeBranch>>;
    fn load_encrypted_file(&self, input: &[u8]) -> Result<Tree>;
    fn emit_plain_file(&self, branches: &[TreeBranch]) -> Result<Vec<u8>>;
    fn emit_encrypted_file(&self, tree: &Tree) -> Result<Vec<u8>>;
    fn emit_value(&self, value: &Value) -> Result<Vec<u8>>;
}

/// Pick a store from the file extension: `.json` documents are structured,
/// everything else is treated as opaque bytes.
pub fn store_for_path(path: &Path) -> Box<dyn Store> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Box::new(JsonStore),
        _ => Box::new(BinaryStore),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgpEntry {
    pub created_at: String,
    pub enc: String,
    pub fp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmsEntry {
    pub arn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    pub created_at: String,
    pub enc: String,
    #[serde(default)]
    pub aws_profile: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcpKmsEntry {
    pub resource_id: String,
    pub created_at: String,
    pub enc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureKvEntry {
    pub vault_url: String,
    pub name: String,
    pub version: String,
    pub created_at: String,
    pub enc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntry {
    pub vault_address: String,
    pub engine_path: String,
    pub key_name: String,
    pub created_at: String,
    pub enc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeEntry {
    pub recipient: String,
    pub enc: String,
}

/// One key group as nested under `key_groups`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireKeyGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp: Option<Vec<PgpEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<Vec<KmsEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_kms: Option<Vec<GcpKmsEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_kv: Option<Vec<AzureKvEntry>>,
    #[serde(default)]
    pub hc_vault: Option<Vec<VaultEntry>>,
    #[serde(default)]
    pub age: Option<Vec<AgeEntry>>,
}

/// Metadata as stored under the `sops` key.
///
/// A single key group is flattened into the top-level key lists; several
/// groups are nested under `key_groups`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMetadata {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub shamir_threshold: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_groups: Vec<WireKeyGroup>,
    #[serde(default)]
    pub kms: Option<Vec<KmsEntry>>,
    #[serde(default)]
    pub gcp_kms: Option<Vec<GcpKmsEntry>>,
    #[serde(default)]
    pub azure_kv: Option<Vec<AzureKvEntry>>,
    #[serde(default)]
    pub hc_vault: Option<Vec<VaultEntry>>,
    #[serde(default)]
    pub age: Option<Vec<AgeEntry>>,
    pub lastmodified: String,
    pub mac: String,
    #[serde(default)]
    pub pgp: Option<Vec<PgpEntry>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unencrypted_suffix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encrypted_suffix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unencrypted_regex: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encrypted_regex: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mac_only_encrypted: bool,
    pub version: String,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn non_empty<T>(entries: Vec<T>) -> Option<Vec<T>> {
    (!entries.is_empty()).then_some(entries)
}

/// Key entries of one group, split by backend.
#[derive(Default)]
struct GroupEntries {
    pgp: Vec<PgpEntry>,
    kms: Vec<KmsEntry>,
    gcp_kms: Vec<GcpKmsEntry>,
    azure_kv: Vec<AzureKvEntry>,
    hc_vault: Vec<VaultEntry>,
    age: Vec<AgeEntry>,
}

impl GroupEntries {
    fn from_group(group: &[MasterKey]) -> Self {
        let mut entries = Self::default();
        for key in group {
            match key {
                MasterKey::Pgp(k) => entries.pgp.push(PgpEntry {
                    created_at: format_timestamp(&k.created_at),
                    enc: k.encrypted_key.clone(),
                    fp: k.fingerprint.clone(),
                }),
                MasterKey::Kms(k) => entries.kms.push(KmsEntry {
                    arn: k.arn.clone(),
                    role: k.role.clone(),
                    context: k.context.clone(),
                    created_at: format_timestamp(&k.created_at),
                    enc: k.encrypted_key.clone(),
                    aws_profile: k.aws_profile.clone(),
                }),
                MasterKey::GcpKms(k) => entries.gcp_kms.push(GcpKmsEntry {
                    resource_id: k.resource_id.clone(),
                    created_at: format_timestamp(&k.created_at),
                    enc: k.encrypted_key.clone(),
                }),
                MasterKey::AzureKv(k) => entries.azure_kv.push(AzureKvEntry {
                    vault_url: k.vault_url.clone(),
                    name: k.name.clone(),
                    version: k.version.clone(),
                    created_at: format_timestamp(&k.created_at),
                    enc: k.encrypted_key.clone(),
                }),
                MasterKey::HcVault(k) => entries.hc_vault.push(VaultEntry {
                    vault_address: k.vault_address.clone(),
                    engine_path: k.engine_path.clone(),
                    key_name: k.key_name.clone(),
                    created_at: format_timestamp(&k.created_at),
                    enc: k.encrypted_key.clone(),
                }),
                MasterKey::Age(k) => entries.age.push(AgeEntry {
                    recipient: k.recipient.clone(),
                    enc: k.encrypted_key.clone(),
                }),
            }
        }
        entries
    }
}

/// The wire entry of a single master key as a JSON object.
pub(crate) fn master_key_map(key: &MasterKey) -> Map<String, JsonValue> {
    let entries = GroupEntries::from_group(std::slice::from_ref(key));
    let value = match key {
        MasterKey::Pgp(_) => serde_json::to_value(&entries.pgp[0]),
        MasterKey::Kms(_) => serde_json::to_value(&entries.kms[0]),
        MasterKey::GcpKms(_) => serde_json::to_value(&entries.gcp_kms[0]),
        MasterKey::AzureKv(_) => serde_json::to_value(&entries.azure_kv[0]),
        MasterKey::HcVault(_) => serde_json::to_value(&entries.hc_vault[0]),
        MasterKey::Age(_) => serde_json::to_value(&entries.age[0]),
    };
    match value {
        Ok(JsonValue::Object(map)) => map,
        _ => Map::new(),
    }
}

impl From<&Metadata> for WireMetadata {
    fn from(metadata: &Metadata) -> Self {
        let (unencrypted_suffix, encrypted_suffix, unencrypted_regex, encrypted_regex) =
            match &metadata.crypt_rule {
                CryptRule::UnencryptedSuffix(s) => {
                    (s.clone(), String::new(), String::new(), String::new())
                }
                CryptRule::EncryptedSuffix(s) => {
                    (String::new(), s.clone(), String::new(), String::new())
                }
                CryptRule::UnencryptedRegex(r) => {
                    (String::new(), String::new(), r.as_str().to_string(), String::new())
                }
                CryptRule::EncryptedRegex(r) => {
                    (String::new(), String::new(), String::new(), r.as_str().to_string())
                }
            };

        let mut wire = WireMetadata {
            shamir_threshold: metadata.shamir_threshold,
            lastmodified: format_timestamp(&metadata.last_modified),
            mac: metadata.mac.clone(),
            unencrypted_suffix,
            encrypted_suffix,
            unencrypted_regex,
            encrypted_regex,
            mac_only_encrypted: metadata.mac_only_encrypted,
            version: metadata.version.clone(),
            ..Default::default()
        };

        if let [group] = metadata.key_groups.as_slice() {
            let entries = GroupEntries::from_group(group);
            wire.pgp = non_empty(entries.pgp);
            wire.kms = non_empty(entries.kms);
            wire.gcp_kms = non_empty(entries.gcp_kms);
            wire.azure_kv = non_empty(entries.azure_kv);
            wire.hc_vault = non_empty(entries.hc_vault);
            wire.age = non_empty(entries.age);
        } else {
            wire.key_groups = metadata
                .key_groups
                .iter()
                .map(|group| {
                    let entries = GroupEntries::from_group(group);
                    WireKeyGroup {
                        pgp: non_empty(entries.pgp),
                        kms: non_empty(entries.kms),
                        gcp_kms: non_empty(entries.gcp_kms),
                        azure_kv: non_empty(entries.azure_kv),
                        hc_vault: non_empty(entries.hc_vault),
                        age: non_empty(entries.age),
                    }
                })
                .collect();
        }
        wire
    }
}

impl WireMetadata {
    /// Convert to the in-memory model, rejecting metadata that cannot be
    /// used to decrypt.
    pub fn to_internal(&self) -> Result<Metadata> {
        let crypt_rule = CryptRule::from_options(
            Some(&self.unencrypted_suffix),
            Some(&self.encrypted_suffix),
            Some(&self.unencrypted_regex),
            Some(&self.encrypted_regex),
        )?;

        let flat = WireKeyGroup {
            pgp: self.pgp.clone(),
            kms: self.kms.clone(),
            gcp_kms: self.gcp_kms.clone(),
            azure_kv: self.azure_kv.clone(),
            hc_vault: self.hc_vault.clone(),
            age: self.age.clone(),
        };
        let key_groups = if flat.has_keys() && !self.key_groups.is_empty() {
            return Err(SopsError::InvalidMetadata(
                "keys are listed both at the top level and in key_groups".into(),
            ));
        } else if flat.has_keys() {
            vec![flat.to_internal()?]
        } else if !self.key_groups.is_empty() {
            self.key_groups
                .iter()
                .map(WireKeyGroup::to_internal)
                .collect::<Result<Vec<_>>>()?
        } else {
            return Err(SopsError::InvalidMetadata("no keys found in file".into()));
        };

        let metadata = Metadata {
            key_groups,
            shamir_threshold: self.shamir_threshold,
            last_modified: parse_timestamp(&self.lastmodified)?,
            mac: self.mac.clone(),
            crypt_rule,
            mac_only_encrypted: self.mac_only_encrypted,
            version: self.version.clone(),
        };
        metadata.validate()?;
        Ok(metadata)
    }
}

impl WireKeyGroup {
    fn has_keys(&self) -> bool {
        [
            self.pgp.as_ref().map(Vec::len),
            self.kms.as_ref().map(Vec::len),
            self.gcp_kms.as_ref().map(Vec::len),
            self.azure_kv.as_ref().map(Vec::len),
            self.hc_vault.as_ref().map(Vec::len),
            self.age.as_ref().map(Vec::len),
        ]
        .into_iter()
        .any(|n| n.unwrap_or(0) > 0)
    }

    /// Keys are ordered kms, gcp_kms, azure_kv, hc_vault, pgp, age.
    fn to_internal(&self) -> Result<KeyGroup> {
        let mut group = Vec::new();
        for k in self.kms.iter().flatten() {
            group.push(MasterKey::Kms(KmsKey {
                arn: k.arn.clone(),
                role: k.role.clone(),
                context: k.context.clone(),
                aws_profile: k.aws_profile.clone(),
                encrypted_key: k.enc.clone(),
                created_at: parse_timestamp(&k.created_at)?,
            }));
        }
        for k in self.gcp_kms.iter().flatten() {
            group.push(MasterKey::GcpKms(GcpKmsKey {
                resource_id: k.resource_id.clone(),
                encrypted_key: k.enc.clone(),
                created_at: parse_timestamp(&k.created_at)?,
            }));
        }
        for k in self.azure_kv.iter().flatten() {
            group.push(MasterKey::AzureKv(AzureKvKey {
                vault_url: k.vault_url.clone(),
                name: k.name.clone(),
                version: k.version.clone(),
                encrypted_key: k.enc.clone(),
                created_at: parse_timestamp(&k.created_at)?,
            }));
        }
        for k in self.hc_vault.iter().flatten() {
            group.push(MasterKey::HcVault(VaultKey {
                vault_address: k.vault_address.clone(),
                engine_path: k.engine_path.clone(),
                key_name: k.key_name.clone(),
                encrypted_key: k.enc.clone(),
                created_at: parse_timestamp(&k.created_at)?,
            }));
        }
        for k in self.pgp.iter().flatten() {
            group.push(MasterKey::Pgp(PgpKey {
                fingerprint: k.fp.clone(),
                encrypted_key: k.enc.clone(),
                created_at: parse_timestamp(&k.created_at)?,
            }));
        }
        for k in self.age.iter().flatten() {
            group.push(MasterKey::Age(AgeKey {
                recipient: k.recipient.clone(),
                encrypted_key: k.enc.clone(),
            }));
        }
        Ok(group)
    }
}
