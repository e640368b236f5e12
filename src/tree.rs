//! # Document Tree
//!
//! The in-memory shape of a structured document and the walker that
//! encrypts or decrypts its leaves.
//!
//! A document is one or more ordered branches of key/value items. Keys keep
//! their insertion order through load, modification and save. Comments are
//! carried as items of their own and are never encrypted or hashed.
//!
//! ## Additional authenticated data
//!
//! Every leaf is bound to its location: the keys leading to it joined with
//! `:` plus a trailing `:` (`a:b:` for `{"a": {"b": 1}}`). Sequence elements
//! share the path of the key holding the sequence.
//!
//! ## MAC
//!
//! While walking, the cleartext rendering of each visited leaf is fed into
//! SHA-512 in document order. The uppercase hex digest is the document MAC.
//! Nulls and comments are skipped; with `mac_only_encrypted` set only
//! encrypted leaves contribute.

use crate::crypto::{format_bool, format_float, DataKey};
use crate::error::{CipherError, Result};
use crate::metadata::Metadata;
use sha2::{Digest, Sha512};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

/// Top-level key holding the encrypted document's metadata.
pub const METADATA_KEY: &str = "sops";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Branch(TreeBranch),
    Array(Vec<Value>),
    Comment(String),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::Branch(_) => "branch",
            Value::Array(_) => "array",
            Value::Comment(_) => "comment",
        }
    }

    /// Cleartext bytes of a scalar, as fed into the MAC.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Int(i) => i.to_string().into_bytes(),
            Value::Float(f) => format_float(*f).into_bytes(),
            Value::Bool(b) => format_bool(*b).as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            other => return Err(CipherError::Unencryptable(other.kind()).into()),
        };
        Ok(bytes)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<TreeBranch> for Value {
    fn from(branch: TreeBranch) -> Self {
        Value::Branch(branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKey {
    Key(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeItem {
    pub key: ItemKey,
    pub value: Value,
}

impl TreeItem {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: ItemKey::Key(key.into()),
            value,
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            key: ItemKey::Comment(text.into()),
            value: Value::Null,
        }
    }
}

/// An ordered mapping of keys to values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeBranch(pub Vec<TreeItem>);

impl TreeBranch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeItem> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find_map(|item| match &item.key {
            ItemKey::Key(k) if k == key => Some(&item.value),
            _ => None,
        })
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.iter_mut().find_map(|item| match &item.key {
            ItemKey::Key(k) if k == key => Some(&mut item.value),
            _ => None,
        })
    }

    /// Replace the value under `key`, or append a new item if absent.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.0.push(TreeItem::new(key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let position = self
            .0
            .iter()
            .position(|item| matches!(&item.key, ItemKey::Key(k) if k == key))?;
        Some(self.0.remove(position).value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl From<Vec<TreeItem>> for TreeBranch {
    fn from(items: Vec<TreeItem>) -> Self {
        Self(items)
    }
}

/// A document: its branches plus the metadata describing how it is protected.
#[derive(Debug, Clone)]
pub struct Tree {
    pub branches: Vec<TreeBranch>,
    pub metadata: Metadata,
    pub file_path: Option<PathBuf>,
}

impl Tree {
    pub fn new(branches: Vec<TreeBranch>, metadata: Metadata) -> Self {
        Self {
            branches,
            metadata,
            file_path: None,
        }
    }

    /// Encrypt every leaf selected by the crypt rule and return the MAC of
    /// the cleartext.
    ///
    /// When a stash is given, a leaf whose cleartext is unchanged since it
    /// was decrypted keeps its previous nonce, so its ciphertext is stable.
    pub fn encrypt(&mut self, key: &DataKey, mut stash: Option<&mut Stash>) -> Result<String> {
        let rule = &self.metadata.crypt_rule;
        let mac_only_encrypted = self.metadata.mac_only_encrypted;
        let mut hasher = Sha512::new();

        for branch in &mut self.branches {
            walk_branch(branch, &mut Vec::new(), &mut |value, path| {
                let encrypted = rule.should_encrypt(path);
                if encrypted || !mac_only_encrypted {
                    hasher.update(value.to_bytes()?);
                }
                if encrypted {
                    let aad = additional_data(path);
                    let nonce = stash
                        .as_deref_mut()
                        .and_then(|stash| stash.take(&aad, value));
                    let envelope = key.encrypt_value(value, &aad, nonce.as_deref())?;
                    *value = Value::String(envelope);
                }
                Ok(())
            })?;
        }

        Ok(hex::encode_upper(hasher.finalize()))
    }

    /// Decrypt every leaf selected by the crypt rule and return the MAC
    /// recomputed over the recovered cleartext.
    pub fn decrypt(&mut self, key: &DataKey, mut stash: Option<&mut Stash>) -> Result<String> {
        let rule = &self.metadata.crypt_rule;
        let mac_only_encrypted = self.metadata.mac_only_encrypted;
        let mut hasher = Sha512::new();

        for branch in &mut self.branches {
            walk_branch(branch, &mut Vec::new(), &mut |value, path| {
                let encrypted = rule.should_encrypt(path);
                if encrypted {
                    let aad = additional_data(path);
                    let Value::String(envelope) = &*value else {
                        return Err(CipherError::Malformed(format!(
                            "{} value at {aad}",
                            value.kind()
                        ))
                        .into());
                    };
                    let (plaintext, nonce) = key.decrypt_value(envelope, &aad)?;
                    if let Some(stash) = stash.as_deref_mut() {
                        stash.record(&aad, plaintext.clone(), nonce);
                    }
                    *value = plaintext;
                }
                if encrypted || !mac_only_encrypted {
                    hasher.update(value.to_bytes()?);
                }
                Ok(())
            })?;
        }

        Ok(hex::encode_upper(hasher.finalize()))
    }
}

/// Path-derived additional authenticated data for a leaf.
pub fn additional_data(path: &[String]) -> String {
    let mut aad = path.join(":");
    aad.push(':');
    aad
}

fn walk_branch<F>(branch: &mut TreeBranch, path: &mut Vec<String>, on_leaf: &mut F) -> Result<()>
where
    F: FnMut(&mut Value, &[String]) -> Result<()>,
{
    for item in &mut branch.0 {
        let ItemKey::Key(key) = &item.key else {
            continue;
        };
        path.push(key.clone());
        walk_value(&mut item.value, path, on_leaf)?;
        path.pop();
    }
    Ok(())
}

fn walk_value<F>(value: &mut Value, path: &mut Vec<String>, on_leaf: &mut F) -> Result<()>
where
    F: FnMut(&mut Value, &[String]) -> Result<()>,
{
    match value {
        Value::Branch(branch) => walk_branch(branch, path, on_leaf),
        Value::Array(items) => {
            for item in items {
                walk_value(item, path, on_leaf)?;
            }
            Ok(())
        }
        Value::Null | Value::Comment(_) => Ok(()),
        _ => on_leaf(value, path),
    }
}

#[derive(Debug, Clone)]
struct StashEntry {
    plaintext: Value,
    nonce: Vec<u8>,
}

/// Nonces observed while decrypting, keyed by leaf path.
///
/// Leaves sharing a path (sequence elements) are queued in document order.
/// A stash is meant for a single decrypt/re-encrypt round trip.
#[derive(Debug, Clone, Default)]
pub struct Stash {
    entries: HashMap<String, VecDeque<StashEntry>>,
}

impl Stash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&mut self, path: &str, plaintext: Value, nonce: Vec<u8>) {
        self.entries
            .entry(path.to_string())
            .or_default()
            .push_back(StashEntry { plaintext, nonce });
    }

    /// Pop the next entry for `path`, yielding its nonce only if the
    /// cleartext still matches.
    fn take(&mut self, path: &str, plaintext: &Value) -> Option<Vec<u8>> {
        let entry = self.entries.get_mut(path)?.pop_front()?;
        (entry.plaintext == *plaintext && !entry.nonce.is_empty()).then_some(entry.nonce)
    }
}
