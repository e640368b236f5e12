use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SopsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("MAC mismatch. File has {stored}, computed {computed}")]
    MacMismatch { stored: String, computed: String },

    #[error("Failed to decrypt original MAC: {0}")]
    MacDecryption(String),

    #[error("Invalid document: {0}")]
    Format(String),

    #[error("sops metadata not found")]
    MetadataNotFound,

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("The key \"{0}\" is reserved for metadata and cannot be used in plaintext documents")]
    ReservedKey(String),

    #[error("Invalid tree path: {0}")]
    InvalidPath(String),

    #[error("Component {0} not found in tree")]
    PathNotFound(String),

    #[error("Shamir error: {0}")]
    Shamir(String),

    #[error(transparent)]
    GetDataKey(#[from] GetDataKeyError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error("Shamir threshold {threshold} is higher than the number of key groups ({groups})")]
    Threshold { threshold: usize, groups: usize },

    #[error("No master keys were provided")]
    NoKeys,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Key service error: {0}")]
    KeyService(String),

    #[error("Key service call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("GPG error: {0}")]
    Gpg(String),

    #[error("age error: {0}")]
    Age(String),

    #[error("Invalid key format")]
    InvalidKeyFormat,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SopsError>;

/// Failures of the value cipher. Each variant maps to a distinct way an
/// envelope can be rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("input string {0:?} does not match the sops envelope format")]
    Malformed(String),

    #[error("could not decode {field} from base64: {message}")]
    Base64 { field: &'static str, message: String },

    #[error("authentication failed: the value was tampered with or the key/path is wrong")]
    Authentication,

    #[error("unknown data type {0:?}")]
    UnknownType(String),

    #[error("cannot parse decrypted value as {kind}: {value:?}")]
    Parse { kind: &'static str, value: String },

    #[error("value of kind {0} cannot be encrypted")]
    Unencryptable(&'static str),

    #[error("invalid nonce length {0}")]
    Nonce(usize),
}

/// Why a single master key could not wrap or unwrap the data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub key: String,
    pub reason: String,
}

/// Outcome of one key group during data key recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReport {
    pub index: usize,
    pub recovered: bool,
    pub failures: Vec<KeyFailure>,
}

/// Raised when too few key groups could be decrypted to rebuild the data key.
#[derive(Error, Debug, Clone)]
pub struct GetDataKeyError {
    pub required: usize,
    pub succeeded: usize,
    pub groups: Vec<GroupReport>,
}

impl fmt::Display for GetDataKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error getting data key: {} successful groups required, got {}",
            self.required, self.succeeded
        )?;
        for group in &self.groups {
            let status = if group.recovered { "SUCCESS" } else { "FAILED" };
            write!(f, "\nGroup {}: {}", group.index, status)?;
            for failure in &group.failures {
                write!(f, "\n  {}: FAILED", failure.key)?;
                for line in failure.reason.lines() {
                    write!(f, "\n    - | {line}")?;
                }
            }
        }
        Ok(())
    }
}

/// Raised when master keys could not wrap the new data key.
#[derive(Error, Debug, Clone)]
pub struct EscrowError {
    pub failures: Vec<(usize, KeyFailure)>,
}

impl fmt::Display for EscrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Could not encrypt the data key with {} master key(s)",
            self.failures.len()
        )?;
        for (group, failure) in &self.failures {
            write!(f, "\n  group {group}: {}: {}", failure.key, failure.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_key_error_lists_every_key() {
        let err = GetDataKeyError {
            required: 2,
            succeeded: 1,
            groups: vec![
                GroupReport {
                    index: 0,
                    recovered: true,
                    failures: vec![],
                },
                GroupReport {
                    index: 1,
                    recovered: false,
                    failures: vec![
                        KeyFailure {
                            key: "age1abc".into(),
                            reason: "no identity matched".into(),
                        },
                        KeyFailure {
                            key: "FPR".into(),
                            reason: "gpg exited with status 2".into(),
                        },
                    ],
                },
            ],
        };

        let rendered = err.to_string();
        assert!(
            rendered.starts_with("Error getting data key: 2 successful groups required, got 1")
        );
        assert!(rendered.contains("Group 0: SUCCESS"));
        assert!(rendered.contains("Group 1: FAILED"));
        assert!(rendered.contains("age1abc: FAILED"));
        assert!(rendered.contains("- | gpg exited with status 2"));
    }

    #[test]
    fn test_escrow_error_names_group_and_key() {
        let err = EscrowError {
            failures: vec![(
                1,
                KeyFailure {
                    key: "arn:aws:kms:us-east-1:1:key/x".into(),
                    reason: "no client".into(),
                },
            )],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("1 master key(s)"));
        assert!(rendered.contains("group 1: arn:aws:kms:us-east-1:1:key/x: no client"));
    }
}
