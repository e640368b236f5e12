//! # Metadata
//!
//! Everything stored next to the document under the `sops` key: the key
//! groups holding wrapped copies (or Shamir shares) of the data key, the
//! Shamir threshold, the encrypted MAC and the rule deciding which leaves
//! get encrypted.

use crate::error::{Result, SopsError};
use crate::keys::MasterKey;
use chrono::{DateTime, SecondsFormat, Utc};
use regex_lite::Regex;

/// Format version written into new documents.
pub const FORMAT_VERSION: &str = "3.9.0";

pub const DEFAULT_UNENCRYPTED_SUFFIX: &str = "_unencrypted";

/// Keys in a group are redundant wrappings of the same secret.
pub type KeyGroup = Vec<MasterKey>;

/// RFC 3339 with second precision and a `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SopsError::InvalidMetadata(format!("invalid timestamp {s:?}: {e}")))
}

/// Decides which leaves are encrypted, judged on every key along the path.
#[derive(Debug, Clone)]
pub enum CryptRule {
    /// Leave a leaf in clear if any key on its path ends with the suffix.
    UnencryptedSuffix(String),
    /// Encrypt a leaf only if some key on its path ends with the suffix.
    EncryptedSuffix(String),
    /// Leave a leaf in clear if any key on its path matches.
    UnencryptedRegex(Regex),
    /// Encrypt a leaf only if some key on its path matches.
    EncryptedRegex(Regex),
}

impl Default for CryptRule {
    fn default() -> Self {
        CryptRule::UnencryptedSuffix(DEFAULT_UNENCRYPTED_SUFFIX.to_string())
    }
}

impl PartialEq for CryptRule {
    fn eq(&self, other: &Self) -> bool {
        self.field_name() == other.field_name() && self.pattern() == other.pattern()
    }
}

impl CryptRule {
    pub fn unencrypted_regex(pattern: &str) -> Result<Self> {
        Ok(CryptRule::UnencryptedRegex(compile(pattern)?))
    }

    pub fn encrypted_regex(pattern: &str) -> Result<Self> {
        Ok(CryptRule::EncryptedRegex(compile(pattern)?))
    }

    /// Build the rule from the four optional settings, of which at most one
    /// may be set.
    pub fn from_options(
        unencrypted_suffix: Option<&str>,
        encrypted_suffix: Option<&str>,
        unencrypted_regex: Option<&str>,
        encrypted_regex: Option<&str>,
    ) -> Result<Self> {
        let set = [
            unencrypted_suffix,
            encrypted_suffix,
            unencrypted_regex,
            encrypted_regex,
        ]
        .iter()
        .filter(|o| o.is_some_and(|s| !s.is_empty()))
        .count();
        if set > 1 {
            return Err(SopsError::InvalidMetadata(
                "cannot use more than one of unencrypted_suffix, encrypted_suffix, \
                 unencrypted_regex and encrypted_regex"
                    .into(),
            ));
        }

        let non_empty = |o: Option<&str>| o.filter(|s| !s.is_empty()).map(str::to_string);
        if let Some(suffix) = non_empty(unencrypted_suffix) {
            Ok(CryptRule::UnencryptedSuffix(suffix))
        } else if let Some(suffix) = non_empty(encrypted_suffix) {
            Ok(CryptRule::EncryptedSuffix(suffix))
        } else if let Some(pattern) = non_empty(unencrypted_regex) {
            Self::unencrypted_regex(&pattern)
        } else if let Some(pattern) = non_empty(encrypted_regex) {
            Self::encrypted_regex(&pattern)
        } else {
            Ok(Self::default())
        }
    }

    pub fn field_name(&self) -> &'static str {
        match self {
            CryptRule::UnencryptedSuffix(_) => "unencrypted_suffix",
            CryptRule::EncryptedSuffix(_) => "encrypted_suffix",
            CryptRule::UnencryptedRegex(_) => "unencrypted_regex",
            CryptRule::EncryptedRegex(_) => "encrypted_regex",
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            CryptRule::UnencryptedSuffix(s) | CryptRule::EncryptedSuffix(s) => s,
            CryptRule::UnencryptedRegex(r) | CryptRule::EncryptedRegex(r) => r.as_str(),
        }
    }

    pub fn should_encrypt(&self, path: &[String]) -> bool {
        match self {
            CryptRule::UnencryptedSuffix(suffix) => {
                !path.iter().any(|k| k.ends_with(suffix.as_str()))
            }
            CryptRule::EncryptedSuffix(suffix) => {
                path.iter().any(|k| k.ends_with(suffix.as_str()))
            }
            CryptRule::UnencryptedRegex(re) => !path.iter().any(|k| re.is_match(k)),
            CryptRule::EncryptedRegex(re) => path.iter().any(|k| re.is_match(k)),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| SopsError::InvalidMetadata(format!("invalid regex {pattern:?}: {e}")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub key_groups: Vec<KeyGroup>,
    /// Zero means unset: all groups are required.
    pub shamir_threshold: usize,
    pub last_modified: DateTime<Utc>,
    /// The document MAC, encrypted with the data key.
    pub mac: String,
    pub crypt_rule: CryptRule,
    pub mac_only_encrypted: bool,
    pub version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            key_groups: Vec::new(),
            shamir_threshold: 0,
            last_modified: Utc::now(),
            mac: String::new(),
            crypt_rule: CryptRule::default(),
            mac_only_encrypted: false,
            version: FORMAT_VERSION.to_string(),
        }
    }
}

impl Metadata {
    pub fn new(key_groups: Vec<KeyGroup>) -> Self {
        Self {
            key_groups,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.shamir_threshold = threshold;
        self
    }

    pub fn with_crypt_rule(mut self, rule: CryptRule) -> Self {
        self.crypt_rule = rule;
        self
    }

    pub fn master_key_count(&self) -> usize {
        self.key_groups.iter().map(Vec::len).sum()
    }

    /// Number of groups that must be recovered to rebuild the data key.
    pub fn required_groups(&self) -> usize {
        match self.key_groups.len() {
            0 | 1 => 1,
            n if self.shamir_threshold == 0 => n,
            _ => self.shamir_threshold,
        }
    }

    /// Reject metadata that can never be decrypted.
    pub fn validate(&self) -> Result<()> {
        if self.master_key_count() == 0 {
            return Err(SopsError::NoKeys);
        }
        if self.shamir_threshold > self.key_groups.len() {
            return Err(SopsError::Threshold {
                threshold: self.shamir_threshold,
                groups: self.key_groups.len(),
            });
        }
        Ok(())
    }

    /// Lower the threshold to the group count when key groups shrink.
    pub fn clamp_threshold(&mut self) {
        if self.shamir_threshold > self.key_groups.len() {
            tracing::warn!(
                threshold = self.shamir_threshold,
                groups = self.key_groups.len(),
                "lowering shamir threshold to the number of key groups"
            );
            self.shamir_threshold = self.key_groups.len();
        }
    }

    /// Add keys to the first group, skipping keys already present.
    pub fn add_master_keys(&mut self, keys: Vec<MasterKey>) {
        if self.key_groups.is_empty() {
            self.key_groups.push(Vec::new());
        }
        for key in keys {
            let identity = key.to_string();
            let exists = self.key_groups[0]
                .iter()
                .any(|k| k.key_type() == key.key_type() && k.to_string() == identity);
            if !exists {
                self.key_groups[0].push(key);
            }
        }
    }

    /// Remove keys from every group by identity. Groups left empty are
    /// dropped and the threshold is clamped.
    pub fn remove_master_keys(&mut self, keys: &[MasterKey]) {
        for group in &mut self.key_groups {
            group.retain(|k| {
                !keys
                    .iter()
                    .any(|r| r.key_type() == k.key_type() && r.to_string() == k.to_string())
            });
        }
        self.key_groups.retain(|g| !g.is_empty());
        self.clamp_threshold();
    }

    /// Append a group. An explicit threshold is kept, so the new group
    /// lowers the share of groups needed; an unset threshold keeps
    /// requiring all of them.
    pub fn add_key_group(&mut self, group: KeyGroup) -> Result<()> {
        if group.is_empty() {
            return Err(SopsError::NoKeys);
        }
        self.key_groups.push(group);
        if self.shamir_threshold != 0 && self.shamir_threshold < self.key_groups.len() {
            tracing::warn!(
                threshold = self.shamir_threshold,
                groups = self.key_groups.len(),
                "key group added; the data key can be recovered without it"
            );
        }
        Ok(())
    }

    pub fn delete_key_group(&mut self, index: usize) -> Result<KeyGroup> {
        if index >= self.key_groups.len() {
            return Err(SopsError::InvalidMetadata(format!(
                "key group {index} does not exist, the document has {}",
                self.key_groups.len()
            )));
        }
        if self.key_groups.len() == 1 {
            return Err(SopsError::InvalidMetadata(
                "cannot delete the only key group".into(),
            ));
        }
        // A document that needed every group keeps needing every group,
        // including ones added later.
        let all_required = self.required_groups() >= self.key_groups.len();
        let removed = self.key_groups.remove(index);
        if all_required {
            self.shamir_threshold = 0;
        } else {
            self.clamp_threshold();
        }
        Ok(removed)
    }
}
