//! # Key Services
//!
//! A key service performs the wrap/unwrap of a data key for one master key.
//! The core never talks to a backend directly: it hands a [`KeyDescriptor`]
//! and the bytes to every configured service in turn.
//!
//! - [`LocalKeyService`] runs the backends in-process (age, PGP, pluggable
//!   cloud clients) and can ask an operator before each operation.
//! - [`rpc::RemoteKeyService`] forwards requests over any [`rpc::Transport`]
//!   to a [`rpc::KeyServiceServer`].
//! - [`timeout::TimeoutKeyService`] bounds the duration of each call.

pub mod rpc;
pub mod timeout;

use crate::error::{Result, SopsError};
use crate::keys::cloud::KmsClient;
use crate::keys::{age, pgp, KeyType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// The identity of a master key, without its wrapped data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyDescriptor {
    Pgp {
        fingerprint: String,
    },
    Kms {
        arn: String,
        #[serde(default)]
        role: String,
        #[serde(default)]
        context: BTreeMap<String, String>,
        #[serde(default)]
        aws_profile: String,
    },
    GcpKms {
        resource_id: String,
    },
    AzureKv {
        vault_url: String,
        name: String,
        version: String,
    },
    HcVault {
        vault_address: String,
        engine_path: String,
        key_name: String,
    },
    Age {
        recipient: String,
    },
}

impl KeyDescriptor {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyDescriptor::Pgp { .. } => KeyType::Pgp,
            KeyDescriptor::Kms { .. } => KeyType::Kms,
            KeyDescriptor::GcpKms { .. } => KeyType::GcpKms,
            KeyDescriptor::AzureKv { .. } => KeyType::AzureKv,
            KeyDescriptor::HcVault { .. } => KeyType::HcVault,
            KeyDescriptor::Age { .. } => KeyType::Age,
        }
    }
}

impl fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyDescriptor::Pgp { fingerprint } => f.write_str(fingerprint),
            KeyDescriptor::Kms { arn, .. } => f.write_str(arn),
            KeyDescriptor::GcpKms { resource_id } => f.write_str(resource_id),
            KeyDescriptor::AzureKv {
                vault_url,
                name,
                version,
            } => write!(f, "{vault_url}/keys/{name}/{version}"),
            KeyDescriptor::HcVault {
                vault_address,
                engine_path,
                key_name,
            } => write!(f, "{vault_address}/v1/{engine_path}/keys/{key_name}"),
            KeyDescriptor::Age { recipient } => f.write_str(recipient),
        }
    }
}

/// Wraps and unwraps data keys on behalf of the core.
pub trait KeyService: Send + Sync {
    fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &KeyDescriptor, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

impl<T: KeyService + ?Sized> KeyService for Arc<T> {
    fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<Vec<u8>> {
        (**self).encrypt(key, plaintext)
    }

    fn decrypt(&self, key: &KeyDescriptor, ciphertext: &[u8]) -> Result<Vec<u8>> {
        (**self).decrypt(key, ciphertext)
    }
}

/// Asks an operator to approve each key service request.
pub trait Prompter: Send + Sync {
    fn approve(&self, operation: &str, key: &KeyDescriptor) -> bool;
}

/// Reads a y/N answer from the terminal.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn approve(&self, operation: &str, key: &KeyDescriptor) -> bool {
        eprint!(
            "Received {operation} request using {} key {key}. Respond with y/N: ",
            key.key_type()
        );
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

/// Runs every backend in the current process.
#[derive(Clone, Default)]
pub struct LocalKeyService {
    age_identities: Vec<String>,
    pgp_public_keys: HashMap<String, String>,
    kms_clients: HashMap<KeyType, Arc<dyn KmsClient>>,
    prompter: Option<Arc<dyn Prompter>>,
}

impl fmt::Debug for LocalKeyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut clients: Vec<_> = self.kms_clients.keys().collect();
        clients.sort();
        f.debug_struct("LocalKeyService")
            .field("age_identities", &self.age_identities.len())
            .field("pgp_public_keys", &self.pgp_public_keys.keys().collect::<Vec<_>>())
            .field("kms_clients", &clients)
            .field("prompt", &self.prompter.is_some())
            .finish()
    }
}

impl LocalKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register age identity text (`AGE-SECRET-KEY-1...` lines).
    pub fn with_age_identity(mut self, identity: impl Into<String>) -> Self {
        self.age_identities.push(identity.into());
        self
    }

    /// Register an armored public key so `fingerprint` is wrapped in-process.
    pub fn with_pgp_public_key(mut self, fingerprint: &str, armored: impl Into<String>) -> Self {
        self.pgp_public_keys
            .insert(fingerprint.replace(' ', "").to_uppercase(), armored.into());
        self
    }

    pub fn with_kms_client(mut self, key_type: KeyType, client: Arc<dyn KmsClient>) -> Self {
        self.kms_clients.insert(key_type, client);
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    fn confirm(&self, operation: &str, key: &KeyDescriptor) -> Result<()> {
        match &self.prompter {
            Some(prompter) if !prompter.approve(operation, key) => Err(
                SopsError::PermissionDenied(format!("{operation} request for {key} was denied")),
            ),
            _ => Ok(()),
        }
    }

    fn kms_client(&self, key: &KeyDescriptor) -> Result<&Arc<dyn KmsClient>> {
        self.kms_clients.get(&key.key_type()).ok_or_else(|| {
            SopsError::UnsupportedKeyType(format!(
                "no {} client configured for {key}",
                key.key_type()
            ))
        })
    }
}

impl KeyService for LocalKeyService {
    fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.confirm("encrypt", key)?;
        tracing::debug!(key_type = %key.key_type(), key = %key, "wrapping data key");
        let wrapped = match key {
            KeyDescriptor::Pgp { fingerprint } => match self.pgp_public_keys.get(fingerprint) {
                Some(armored) => pgp::wrap_with_public_key(armored, plaintext)?,
                None => pgp::wrap_with_gpg(fingerprint, plaintext)?,
            },
            KeyDescriptor::Age { recipient } => age::wrap_key(recipient, plaintext)?,
            other => self.kms_client(other)?.encrypt(other, plaintext)?,
        };
        Ok(wrapped.into_bytes())
    }

    fn decrypt(&self, key: &KeyDescriptor, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.confirm("decrypt", key)?;
        tracing::debug!(key_type = %key.key_type(), key = %key, "unwrapping data key");
        let ciphertext = std::str::from_utf8(ciphertext)
            .map_err(|_| SopsError::KeyService(format!("{key}: wrapped key is not text")))?;
        match key {
            KeyDescriptor::Pgp { .. } => pgp::unwrap_with_gpg(ciphertext),
            KeyDescriptor::Age { .. } => age::unwrap_key(ciphertext, &self.age_identities),
            other => self.kms_client(other)?.decrypt(other, ciphertext),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic in-memory service. Each wrap is bound to the key that
    /// produced it; keys listed as failing always error.
    #[derive(Default)]
    pub(crate) struct ScriptedKeyService {
        failing: HashSet<String>,
        calls: AtomicUsize,
    }

    impl ScriptedKeyService {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn failing(keys: &[&str]) -> Self {
            Self {
                failing: keys.iter().map(|k| k.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn check(&self, key: &KeyDescriptor) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&key.to_string()) {
                return Err(SopsError::KeyService(format!("scripted failure for {key}")));
            }
            Ok(())
        }
    }

    impl KeyService for ScriptedKeyService {
        fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<Vec<u8>> {
            self.check(key)?;
            Ok(format!("wrapped|{key}|{}", hex::encode(plaintext)).into_bytes())
        }

        fn decrypt(&self, key: &KeyDescriptor, ciphertext: &[u8]) -> Result<Vec<u8>> {
            self.check(key)?;
            let text = String::from_utf8_lossy(ciphertext);
            let (owner, data) = text
                .strip_prefix("wrapped|")
                .and_then(|rest| rest.rsplit_once('|'))
                .ok_or_else(|| SopsError::KeyService("not a scripted wrap".into()))?;
            if owner != key.to_string() {
                return Err(SopsError::KeyService(format!("{key} cannot unwrap {owner}")));
            }
            hex::decode(data).map_err(|e| SopsError::KeyService(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoClient;

    impl KmsClient for EchoClient {
        fn encrypt(&self, key: &KeyDescriptor, plaintext: &[u8]) -> Result<String> {
            Ok(format!("{}:{}", key.key_type(), hex::encode(plaintext)))
        }

        fn decrypt(&self, _key: &KeyDescriptor, ciphertext: &str) -> Result<Vec<u8>> {
            let (_, data) = ciphertext.split_once(':').unwrap_or(("", ciphertext));
            hex::decode(data).map_err(|e| SopsError::KeyService(e.to_string()))
        }
    }

    struct Recorder {
        answer: bool,
        seen: Mutex<Vec<String>>,
    }

    impl Prompter for Recorder {
        fn approve(&self, operation: &str, key: &KeyDescriptor) -> bool {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{operation} {key}"));
            self.answer
        }
    }

    fn gcp() -> KeyDescriptor {
        KeyDescriptor::GcpKms {
            resource_id: "projects/p/locations/global/keyRings/r/cryptoKeys/k".into(),
        }
    }

    #[test]
    fn test_cloud_keys_dispatch_to_registered_client() {
        let service = LocalKeyService::new().with_kms_client(KeyType::GcpKms, Arc::new(EchoClient));
        let wrapped = service.encrypt(&gcp(), b"data").unwrap();
        assert_eq!(wrapped, b"gcp_kms:64617461");
        assert_eq!(service.decrypt(&gcp(), &wrapped).unwrap(), b"data");
    }

    #[test]
    fn test_cloud_keys_without_client_are_unsupported() {
        let service = LocalKeyService::new();
        let err = service.encrypt(&gcp(), b"data").unwrap_err();
        assert!(matches!(err, SopsError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_denied_prompt_is_permission_denied() {
        let recorder = Arc::new(Recorder {
            answer: false,
            seen: Mutex::new(Vec::new()),
        });
        let service = LocalKeyService::new()
            .with_kms_client(KeyType::GcpKms, Arc::new(EchoClient))
            .with_prompter(recorder.clone());

        let err = service.encrypt(&gcp(), b"data").unwrap_err();
        assert!(matches!(err, SopsError::PermissionDenied(_)));
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert!(recorder.seen.lock().unwrap()[0].starts_with("encrypt projects/p"));
    }

    #[test]
    fn test_approved_prompt_lets_request_through() {
        let service = LocalKeyService::new()
            .with_kms_client(KeyType::GcpKms, Arc::new(EchoClient))
            .with_prompter(Arc::new(Recorder {
                answer: true,
                seen: Mutex::new(Vec::new()),
            }));
        assert!(service.encrypt(&gcp(), b"data").is_ok());
    }

    #[test]
    fn test_descriptor_serializes_with_type_tag() {
        let json = serde_json::to_value(KeyDescriptor::Age {
            recipient: "age1xyz".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "age");
        assert_eq!(json["recipient"], "age1xyz");

        let parsed: KeyDescriptor = serde_json::from_str(
            r#"{"type":"hc_vault","vault_address":"https://v:8200","engine_path":"transit","key_name":"k"}"#,
        )
        .unwrap();
        assert_eq!(parsed.to_string(), "https://v:8200/v1/transit/keys/k");
    }

    #[test]
    fn test_scripted_service_binds_wrap_to_key() {
        let service = testing::ScriptedKeyService::new();
        let a = KeyDescriptor::Age {
            recipient: "age1a".into(),
        };
        let b = KeyDescriptor::Age {
            recipient: "age1b".into(),
        };
        let wrapped = service.encrypt(&a, b"k").unwrap();
        assert_eq!(service.decrypt(&a, &wrapped).unwrap(), b"k");
        assert!(service.decrypt(&b, &wrapped).is_err());
    }
}
