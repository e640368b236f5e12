//! # Master Keys
//!
//! A master key wraps the document's data key. Each backend keeps the
//! identity needed to reach it plus the wrapped key it produced; the actual
//! wrap/unwrap is delegated to a [`KeyService`].
//!
//! | Backend        | Identity                                    | Rotates |
//! |----------------|---------------------------------------------|---------|
//! | PGP            | fingerprint                                 | 6 months |
//! | AWS KMS        | key ARN, optional role, encryption context  | 6 months |
//! | GCP KMS        | resource id                                 | 6 months |
//! | Azure Key Vault| vault URL, key name, key version            | 6 months |
//! | Vault transit  | server address, engine path, key name       | 6 months |
//! | age            | recipient                                   | never    |

pub mod age;
pub mod cloud;
pub mod pgp;

use crate::error::{Result, SopsError};
use crate::keyservice::{KeyDescriptor, KeyService};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Keys older than this are re-wrapped when a document's keys are updated.
pub const ROTATION_TTL_DAYS: i64 = 30 * 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyType {
    Pgp,
    Kms,
    GcpKms,
    AzureKv,
    HcVault,
    Age,
}

impl KeyType {
    pub const ALL: [KeyType; 6] = [
        KeyType::Pgp,
        KeyType::Kms,
        KeyType::GcpKms,
        KeyType::AzureKv,
        KeyType::HcVault,
        KeyType::Age,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Pgp => "pgp",
            KeyType::Kms => "kms",
            KeyType::GcpKms => "gcp_kms",
            KeyType::AzureKv => "azure_kv",
            KeyType::HcVault => "hc_vault",
            KeyType::Age => "age",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = SopsError;

    fn from_str(s: &str) -> Result<Self> {
        KeyType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| SopsError::UnsupportedKeyType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PgpKey {
    pub fingerprint: String,
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
}

impl PgpKey {
    pub fn new(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.replace(' ', "").to_uppercase(),
            encrypted_key: String::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KmsKey {
    pub arn: String,
    pub role: String,
    pub context: BTreeMap<String, String>,
    pub aws_profile: String,
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
}

impl KmsKey {
    /// Build a key from `ARN[+ROLE_ARN]`.
    pub fn new(arn: &str, context: BTreeMap<String, String>, aws_profile: &str) -> Self {
        let (arn, role) = cloud::split_kms_arn(arn);
        Self {
            arn,
            role,
            context,
            aws_profile: aws_profile.to_string(),
            encrypted_key: String::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GcpKmsKey {
    pub resource_id: String,
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
}

impl GcpKmsKey {
    pub fn new(resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.trim().to_string(),
            encrypted_key: String::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AzureKvKey {
    pub vault_url: String,
    pub name: String,
    pub version: String,
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
}

impl AzureKvKey {
    pub fn new(vault_url: &str, name: &str, version: &str) -> Self {
        Self {
            vault_url: vault_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            version: version.to_string(),
            encrypted_key: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Parse `https://<vault>/keys/<name>/<version>`.
    pub fn from_url(url: &str) -> Result<Self> {
        let (vault_url, name, version) = cloud::parse_azure_key_url(url)?;
        Ok(Self::new(&vault_url, &name, &version))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VaultKey {
    pub vault_address: String,
    pub engine_path: String,
    pub key_name: String,
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
}

impl VaultKey {
    pub fn new(vault_address: &str, engine_path: &str, key_name: &str) -> Self {
        Self {
            vault_address: vault_address.trim_end_matches('/').to_string(),
            engine_path: engine_path.trim_matches('/').to_string(),
            key_name: key_name.to_string(),
            encrypted_key: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Parse `https://<host>/v1/<engine path>/keys/<name>`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (address, engine, name) = cloud::parse_vault_uri(uri)?;
        Ok(Self::new(&address, &engine, &name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgeKey {
    pub recipient: String,
    pub encrypted_key: String,
}

impl AgeKey {
    /// Build a key for a recipient, rejecting strings age cannot parse.
    pub fn new(recipient: &str) -> Result<Self> {
        let recipient = recipient.trim();
        age::validate_recipient(recipient)?;
        Ok(Self {
            recipient: recipient.to_string(),
            encrypted_key: String::new(),
        })
    }
}

/// One wrapping of the data key.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterKey {
    Pgp(PgpKey),
    Kms(KmsKey),
    GcpKms(GcpKmsKey),
    AzureKv(AzureKvKey),
    HcVault(VaultKey),
    Age(AgeKey),
}

impl MasterKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            MasterKey::Pgp(_) => KeyType::Pgp,
            MasterKey::Kms(_) => KeyType::Kms,
            MasterKey::GcpKms(_) => KeyType::GcpKms,
            MasterKey::AzureKv(_) => KeyType::AzureKv,
            MasterKey::HcVault(_) => KeyType::HcVault,
            MasterKey::Age(_) => KeyType::Age,
        }
    }

    pub fn encrypted_key(&self) -> &str {
        match self {
            MasterKey::Pgp(k) => &k.encrypted_key,
            MasterKey::Kms(k) => &k.encrypted_key,
            MasterKey::GcpKms(k) => &k.encrypted_key,
            MasterKey::AzureKv(k) => &k.encrypted_key,
            MasterKey::HcVault(k) => &k.encrypted_key,
            MasterKey::Age(k) => &k.encrypted_key,
        }
    }

    pub fn set_encrypted_key(&mut self, encrypted: String) {
        let slot = match self {
            MasterKey::Pgp(k) => &mut k.encrypted_key,
            MasterKey::Kms(k) => &mut k.encrypted_key,
            MasterKey::GcpKms(k) => &mut k.encrypted_key,
            MasterKey::AzureKv(k) => &mut k.encrypted_key,
            MasterKey::HcVault(k) => &mut k.encrypted_key,
            MasterKey::Age(k) => &mut k.encrypted_key,
        };
        *slot = encrypted;
    }

    /// Creation time of the wrapping; age keys do not carry one.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            MasterKey::Pgp(k) => Some(k.created_at),
            MasterKey::Kms(k) => Some(k.created_at),
            MasterKey::GcpKms(k) => Some(k.created_at),
            MasterKey::AzureKv(k) => Some(k.created_at),
            MasterKey::HcVault(k) => Some(k.created_at),
            MasterKey::Age(_) => None,
        }
    }

    fn touch(&mut self) {
        let now = Utc::now();
        match self {
            MasterKey::Pgp(k) => k.created_at = now,
            MasterKey::Kms(k) => k.created_at = now,
            MasterKey::GcpKms(k) => k.created_at = now,
            MasterKey::AzureKv(k) => k.created_at = now,
            MasterKey::HcVault(k) => k.created_at = now,
            MasterKey::Age(_) => {}
        }
    }

    pub fn needs_rotation(&self) -> bool {
        self.created_at()
            .is_some_and(|created| Utc::now() - created > Duration::days(ROTATION_TTL_DAYS))
    }

    /// The identity handed to a key service.
    pub fn descriptor(&self) -> KeyDescriptor {
        match self {
            MasterKey::Pgp(k) => KeyDescriptor::Pgp {
                fingerprint: k.fingerprint.clone(),
            },
            MasterKey::Kms(k) => KeyDescriptor::Kms {
                arn: k.arn.clone(),
                role: k.role.clone(),
                context: k.context.clone(),
                aws_profile: k.aws_profile.clone(),
            },
            MasterKey::GcpKms(k) => KeyDescriptor::GcpKms {
                resource_id: k.resource_id.clone(),
            },
            MasterKey::AzureKv(k) => KeyDescriptor::AzureKv {
                vault_url: k.vault_url.clone(),
                name: k.name.clone(),
                version: k.version.clone(),
            },
            MasterKey::HcVault(k) => KeyDescriptor::HcVault {
                vault_address: k.vault_address.clone(),
                engine_path: k.engine_path.clone(),
                key_name: k.key_name.clone(),
            },
            MasterKey::Age(k) => KeyDescriptor::Age {
                recipient: k.recipient.clone(),
            },
        }
    }

    /// Wrap `data_key` through `service` and store the result.
    pub fn encrypt(&mut self, data_key: &[u8], service: &dyn KeyService) -> Result<()> {
        let wrapped = service.encrypt(&self.descriptor(), data_key)?;
        let wrapped = String::from_utf8(wrapped)
            .map_err(|_| SopsError::KeyService(format!("{self}: wrapped key is not text")))?;
        self.set_encrypted_key(wrapped);
        self.touch();
        Ok(())
    }

    /// Wrap only when no wrapped key is stored yet.
    pub fn encrypt_if_needed(&mut self, data_key: &[u8], service: &dyn KeyService) -> Result<()> {
        if self.encrypted_key().is_empty() {
            self.encrypt(data_key, service)?;
        }
        Ok(())
    }

    /// Unwrap the stored key through `service`.
    pub fn decrypt(&self, service: &dyn KeyService) -> Result<Vec<u8>> {
        if self.encrypted_key().is_empty() {
            return Err(SopsError::KeyService(format!(
                "{self}: no encrypted data key stored"
            )));
        }
        service.decrypt(&self.descriptor(), self.encrypted_key().as_bytes())
    }

    /// The entry written for this key in the document metadata.
    pub fn to_map(&self) -> Map<String, JsonValue> {
        crate::stores::master_key_map(self)
    }
}

impl fmt::Display for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterKey::Pgp(k) => f.write_str(&k.fingerprint),
            MasterKey::Kms(k) => f.write_str(&k.arn),
            MasterKey::GcpKms(k) => f.write_str(&k.resource_id),
            MasterKey::AzureKv(k) => write!(f, "{}/keys/{}/{}", k.vault_url, k.name, k.version),
            MasterKey::HcVault(k) => write!(
                f,
                "{}/v1/{}/keys/{}",
                k.vault_address, k.engine_path, k.key_name
            ),
            MasterKey::Age(k) => f.write_str(&k.recipient),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyservice::testing::ScriptedKeyService;

    #[test]
    fn test_identifiers_are_stable() {
        let pgp = MasterKey::Pgp(PgpKey::new("85D7 7543 B3D6 24B6 3CEA 9E6D BC17 301B 491B 3F21"));
        assert_eq!(pgp.to_string(), "85D77543B3D624B63CEA9E6DBC17301B491B3F21");

        let kms = MasterKey::Kms(KmsKey::new(
            "arn:aws:kms:us-east-1:656532927350:key/920aff2e+arn:aws:iam::927034868273:role/sops",
            BTreeMap::new(),
            "",
        ));
        assert_eq!(kms.to_string(), "arn:aws:kms:us-east-1:656532927350:key/920aff2e");

        let azure = MasterKey::AzureKv(AzureKvKey::new("https://v.vault.azure.net/", "k", "1"));
        assert_eq!(azure.to_string(), "https://v.vault.azure.net/keys/k/1");

        let vault = MasterKey::HcVault(VaultKey::new("https://vault:8200", "/sops/", "k1"));
        assert_eq!(vault.to_string(), "https://vault:8200/v1/sops/keys/k1");
    }

    #[test]
    fn test_key_type_round_trips_through_str() {
        for t in KeyType::ALL {
            assert_eq!(t.as_str().parse::<KeyType>().unwrap(), t);
        }
        assert!("yubikey".parse::<KeyType>().is_err());
    }

    #[test]
    fn test_needs_rotation_after_six_months() {
        let mut key = PgpKey::new("ABC");
        assert!(!MasterKey::Pgp(key.clone()).needs_rotation());
        key.created_at = Utc::now() - Duration::days(ROTATION_TTL_DAYS + 1);
        assert!(MasterKey::Pgp(key).needs_rotation());
    }

    #[test]
    fn test_age_keys_never_need_rotation() {
        let key = MasterKey::Age(AgeKey {
            recipient: "age1test".into(),
            encrypted_key: "x".into(),
        });
        assert!(!key.needs_rotation());
        assert!(key.created_at().is_none());
    }

    #[test]
    fn test_encrypt_stores_wrapped_key_and_refreshes_timestamp() {
        let service = ScriptedKeyService::new();
        let mut key = PgpKey::new("ABC");
        key.created_at = Utc::now() - Duration::days(400);
        let mut key = MasterKey::Pgp(key);

        key.encrypt(b"secret", &service).unwrap();
        assert!(!key.encrypted_key().is_empty());
        assert!(!key.needs_rotation());
        assert_eq!(key.decrypt(&service).unwrap(), b"secret");
    }

    #[test]
    fn test_encrypt_if_needed_keeps_existing_wrap() {
        let service = ScriptedKeyService::new();
        let resource = "projects/p/locations/l/keyRings/r/cryptoKeys/k";
        let mut key = MasterKey::GcpKms(GcpKmsKey::new(resource));
        key.set_encrypted_key("already".into());
        key.encrypt_if_needed(b"secret", &service).unwrap();
        assert_eq!(key.encrypted_key(), "already");
    }

    #[test]
    fn test_decrypt_without_wrapped_key_fails() {
        let service = ScriptedKeyService::new();
        let key = MasterKey::Pgp(PgpKey::new("ABC"));
        assert!(key.decrypt(&service).is_err());
    }

    #[test]
    fn test_to_map_includes_identity_and_enc() {
        let mut context = BTreeMap::new();
        context.insert("env".to_string(), "prod".to_string());
        let mut key = MasterKey::Kms(KmsKey::new("arn:aws:kms:eu-west-1:1:key/k", context, "dev"));
        key.set_encrypted_key("blob".into());

        let map = key.to_map();
        assert_eq!(map["arn"], "arn:aws:kms:eu-west-1:1:key/k");
        assert_eq!(map["aws_profile"], "dev");
        assert_eq!(map["enc"], "blob");
        assert_eq!(map["context"]["env"], "prod");
        assert!(map.contains_key("created_at"));
        assert!(!map.contains_key("role"));
    }
}
