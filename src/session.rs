//! # Sessions
//!
//! A [`Session`] carries everything an operation needs besides the document:
//! the key services, the decryption order, the escrow mode, the MAC policy
//! and an optional auditor. Each operation recovers or generates the data
//! key on its own; nothing is cached between calls.
//!
//! All operations work on a copy of the in-memory [`Tree`] and replace the
//! caller's tree only when they succeed. A failed operation leaves both the
//! ciphertext and the metadata as they were.

use crate::audit::{AuditAction, AuditEvent, Auditor};
use crate::config::Settings;
use crate::crypto::DataKey;
use crate::error::{Result, SopsError};
use crate::escrow::{self, EscrowMode, EscrowScope, DEFAULT_DECRYPTION_ORDER};
use crate::keys::{KeyType, MasterKey};
use crate::keyservice::KeyService;
use crate::metadata::{format_timestamp, KeyGroup, Metadata};
use crate::path::{self, PathSegment};
use crate::tree::{Stash, Tree, TreeBranch, Value};
use chrono::{SubsecRound, Utc};
use std::sync::Arc;

pub struct Session {
    services: Vec<Arc<dyn KeyService>>,
    decryption_order: Vec<KeyType>,
    escrow_mode: EscrowMode,
    ignore_mac: bool,
    auditor: Option<Arc<dyn Auditor>>,
}

impl Session {
    pub fn new(services: Vec<Arc<dyn KeyService>>) -> Self {
        Self {
            services,
            decryption_order: DEFAULT_DECRYPTION_ORDER.to_vec(),
            escrow_mode: EscrowMode::default(),
            ignore_mac: false,
            auditor: None,
        }
    }

    pub fn from_settings(settings: &Settings, services: Vec<Arc<dyn KeyService>>) -> Self {
        Self::new(services)
            .with_decryption_order(settings.decryption_order.clone())
            .with_escrow_mode(settings.escrow_mode)
    }

    pub fn with_decryption_order(mut self, order: Vec<KeyType>) -> Self {
        self.decryption_order = order;
        self
    }

    pub fn with_escrow_mode(mut self, mode: EscrowMode) -> Self {
        self.escrow_mode = mode;
        self
    }

    /// Accept documents whose MAC is missing or does not match.
    pub fn with_ignore_mac(mut self, ignore: bool) -> Self {
        self.ignore_mac = ignore;
        self
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// Encrypt plaintext branches under a fresh data key escrowed to the
    /// key groups of `metadata`.
    pub fn encrypt(&self, branches: Vec<TreeBranch>, mut metadata: Metadata) -> Result<Tree> {
        self.audited(AuditAction::Encrypt, None, || {
            metadata.clamp_threshold();
            let mut tree = Tree::new(branches, metadata);
            let key = DataKey::generate();
            escrow::escrow_data_key(
                &mut tree.metadata,
                &key,
                &self.services,
                self.escrow_mode,
                EscrowScope::All,
            )?;
            self.seal(&mut tree, &key, None)?;
            Ok(tree)
        })
    }

    /// Decrypt every encrypted leaf in place and verify the MAC.
    pub fn decrypt(&self, tree: &mut Tree) -> Result<()> {
        let file = tree.file_path.clone();
        self.audited(AuditAction::Decrypt, file.as_deref(), || {
            commit(tree, |tree| self.open(tree, None).map(|_| ()))
        })
    }

    /// Decrypt and return the value at `path`.
    pub fn extract(&self, tree: &mut Tree, path: &[PathSegment]) -> Result<Value> {
        let file = tree.file_path.clone();
        self.audited(AuditAction::Decrypt, file.as_deref(), || {
            commit(tree, |tree| {
                self.open(tree, None)?;
                match tree.branches.first() {
                    Some(branch) => path::truncate(branch, path),
                    None => Err(SopsError::PathNotFound(path::format_path(path))),
                }
            })
        })
    }

    /// Replace the data key. Keys in `add` join the first group and keys in
    /// `remove` leave every group before the new key is escrowed; every
    /// leaf is re-encrypted with a fresh nonce.
    pub fn rotate(&self, tree: &mut Tree, add: Vec<MasterKey>, remove: &[MasterKey]) -> Result<()> {
        let file = tree.file_path.clone();
        self.audited(AuditAction::Rotate, file.as_deref(), || {
            commit(tree, |tree| {
                self.open(tree, None)?;
                if !add.is_empty() {
                    tree.metadata.add_master_keys(add);
                }
                if !remove.is_empty() {
                    tree.metadata.remove_master_keys(remove);
                }
                tree.metadata.clamp_threshold();

                let key = DataKey::generate();
                escrow::escrow_data_key(
                    &mut tree.metadata,
                    &key,
                    &self.services,
                    self.escrow_mode,
                    EscrowScope::All,
                )?;
                self.seal(tree, &key, None)
            })
        })
    }

    /// Change the key groups without replacing the data key.
    ///
    /// Unchanged leaves keep their ciphertext. Keys without a wrapped copy,
    /// or due for rotation, are wrapped; documents split across several
    /// groups get fresh shares for every key.
    pub fn update_keys<F>(&self, tree: &mut Tree, change: F) -> Result<()>
    where
        F: FnOnce(&mut Metadata) -> Result<()>,
    {
        let file = tree.file_path.clone();
        self.audited(AuditAction::UpdateKeys, file.as_deref(), || {
            commit(tree, |tree| {
                let mut stash = Stash::new();
                let key = self.open(tree, Some(&mut stash))?;

                let groups_before = tree.metadata.key_groups.len();
                change(&mut tree.metadata)?;
                tree.metadata.clamp_threshold();

                let scope = if groups_before > 1 {
                    EscrowScope::All
                } else {
                    EscrowScope::Stale
                };
                let metadata = &mut tree.metadata;
                escrow::escrow_data_key(metadata, &key, &self.services, self.escrow_mode, scope)?;
                self.seal(tree, &key, Some(&mut stash))
            })
        })
    }

    pub fn add_master_keys(&self, tree: &mut Tree, keys: Vec<MasterKey>) -> Result<()> {
        self.update_keys(tree, |metadata| {
            metadata.add_master_keys(keys);
            Ok(())
        })
    }

    pub fn remove_master_keys(&self, tree: &mut Tree, keys: &[MasterKey]) -> Result<()> {
        self.update_keys(tree, |metadata| {
            metadata.remove_master_keys(keys);
            Ok(())
        })
    }

    pub fn add_key_group(&self, tree: &mut Tree, group: KeyGroup) -> Result<()> {
        self.update_keys(tree, |metadata| metadata.add_key_group(group))
    }

    pub fn delete_key_group(&self, tree: &mut Tree, index: usize) -> Result<()> {
        self.update_keys(tree, |metadata| metadata.delete_key_group(index).map(|_| ()))
    }

    /// Store `value` at `path`. Leaves other than the one written keep
    /// their ciphertext.
    pub fn set(&self, tree: &mut Tree, path: &[PathSegment], value: Value) -> Result<()> {
        let file = tree.file_path.clone();
        self.audited(AuditAction::Set, file.as_deref(), || {
            commit(tree, |tree| {
                let mut stash = Stash::new();
                let key = self.open(tree, Some(&mut stash))?;
                if tree.branches.is_empty() {
                    tree.branches.push(TreeBranch::new());
                }
                path::set(&mut tree.branches[0], path, value)?;
                self.seal(tree, &key, Some(&mut stash))
            })
        })
    }

    /// Remove the value at `path` and return it.
    pub fn unset(&self, tree: &mut Tree, path: &[PathSegment]) -> Result<Value> {
        let file = tree.file_path.clone();
        self.audited(AuditAction::Unset, file.as_deref(), || {
            commit(tree, |tree| {
                let mut stash = Stash::new();
                let key = self.open(tree, Some(&mut stash))?;
                let branch = tree
                    .branches
                    .first_mut()
                    .ok_or_else(|| SopsError::PathNotFound(path::format_path(path)))?;
                let removed = path::unset(branch, path)?;
                self.seal(tree, &key, Some(&mut stash))?;
                Ok(removed)
            })
        })
    }

    /// Recover the data key, decrypt the tree and check its MAC.
    fn open(&self, tree: &mut Tree, stash: Option<&mut Stash>) -> Result<DataKey> {
        let key = escrow::recover_data_key(&tree.metadata, &self.services, &self.decryption_order)?;
        let computed = tree.decrypt(&key, stash)?;
        self.verify_mac(&tree.metadata, &key, computed)?;
        Ok(key)
    }

    fn verify_mac(&self, metadata: &Metadata, key: &DataKey, computed: String) -> Result<()> {
        let aad = format_timestamp(&metadata.last_modified);
        let stored = match key.decrypt_value(&metadata.mac, &aad) {
            Ok((Value::String(mac), _)) => mac,
            Ok((other, _)) => {
                return self.mac_problem(SopsError::MacDecryption(format!(
                    "expected a string MAC, found {}",
                    other.kind()
                )))
            }
            Err(err) => return self.mac_problem(SopsError::MacDecryption(err.to_string())),
        };

        if stored != computed {
            let stored = if stored.is_empty() {
                "no MAC".to_string()
            } else {
                stored
            };
            return self.mac_problem(SopsError::MacMismatch { stored, computed });
        }
        Ok(())
    }

    fn mac_problem(&self, err: SopsError) -> Result<()> {
        if self.ignore_mac {
            tracing::warn!(%err, "ignoring MAC verification failure");
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Encrypt the tree, stamp the modification time and store the MAC
    /// encrypted against that time.
    fn seal(&self, tree: &mut Tree, key: &DataKey, stash: Option<&mut Stash>) -> Result<()> {
        let mac = tree.encrypt(key, stash)?;
        tree.metadata.last_modified = Utc::now().trunc_subsecs(0);
        let aad = format_timestamp(&tree.metadata.last_modified);
        tree.metadata.mac = key.encrypt_value(&Value::String(mac), &aad, None)?;
        Ok(())
    }

    fn audited<T, F>(&self, action: AuditAction, file: Option<&std::path::Path>, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let result = op();
        if let Some(auditor) = &self.auditor {
            let event = AuditEvent::new(action, file);
            auditor.record(match &result {
                Ok(_) => event,
                Err(err) => event.with_failure().with_detail(err.to_string()),
            });
        }
        result
    }
}

/// Run `op` against a copy of `tree` and keep the copy only on success.
fn commit<T, F>(tree: &mut Tree, op: F) -> Result<T>
where
    F: FnOnce(&mut Tree) -> Result<T>,
{
    let mut working = tree.clone();
    let out = op(&mut working)?;
    *tree = working;
    Ok(out)
}
