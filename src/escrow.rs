//! # Data Key Escrow
//!
//! Escrow hands the data key (or, with several key groups, one Shamir share
//! per group) to every master key of the group. Recovery walks the groups,
//! unwraps one part per group with the first master key that succeeds and
//! rebuilds the data key once enough groups have answered.
//!
//! Every master key is tried against the configured key services in order;
//! the first service that succeeds wins. Failures are collected per key so
//! the caller sees every backend that refused at once.

use crate::crypto::DataKey;
use crate::error::{EscrowError, GetDataKeyError, GroupReport, KeyFailure, Result, SopsError};
use crate::keys::{KeyType, MasterKey};
use crate::keyservice::KeyService;
use crate::metadata::Metadata;
use crate::shamir;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use zeroize::Zeroize;

/// Key types tried first when unwrapping: local backends before remote ones.
pub const DEFAULT_DECRYPTION_ORDER: [KeyType; 2] = [KeyType::Age, KeyType::Pgp];

/// How wrap failures affect an escrow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscrowMode {
    /// Any failing master key aborts the operation; every failure is reported.
    #[default]
    Strict,
    /// Abort only when a whole group failed. Keys that failed lose their
    /// stored wrap instead of keeping a stale one.
    GroupQuorum,
    /// Abort at the first failing master key.
    FailFast,
}

impl FromStr for EscrowMode {
    type Err = SopsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "strict" => Ok(EscrowMode::Strict),
            "group-quorum" => Ok(EscrowMode::GroupQuorum),
            "fail-fast" => Ok(EscrowMode::FailFast),
            other => Err(SopsError::Config(format!("unknown escrow mode {other:?}"))),
        }
    }
}

impl fmt::Display for EscrowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EscrowMode::Strict => "strict",
            EscrowMode::GroupQuorum => "group-quorum",
            EscrowMode::FailFast => "fail-fast",
        })
    }
}

/// Which master keys an escrow wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowScope {
    /// Every master key, replacing existing wraps.
    All,
    /// Only keys without a wrap or due for rotation. Applies to single-group
    /// documents; Shamir shares are always regenerated for every key.
    Stale,
}

/// Wrap `data_key` with the master keys of `metadata`.
///
/// With more than one group the key is split and an unset threshold is
/// persisted as the group count.
pub fn escrow_data_key(
    metadata: &mut Metadata,
    data_key: &DataKey,
    services: &[Arc<dyn KeyService>],
    mode: EscrowMode,
    scope: EscrowScope,
) -> Result<()> {
    metadata.validate()?;

    let group_count = metadata.key_groups.len();
    let (mut parts, scope) = if group_count > 1 {
        if metadata.shamir_threshold == 0 {
            metadata.shamir_threshold = group_count;
        }
        let shares = shamir::split(data_key.as_bytes(), group_count, metadata.shamir_threshold)?;
        (shares, EscrowScope::All)
    } else {
        (vec![data_key.as_bytes().to_vec()], scope)
    };

    let mut failures = Vec::new();
    let mut healthy_groups = vec![0usize; group_count];

    for (index, group) in metadata.key_groups.iter_mut().enumerate() {
        let part = &parts[index];
        for key in group.iter_mut() {
            let current = !key.encrypted_key().is_empty() && !key.needs_rotation();
            if scope == EscrowScope::Stale && current {
                healthy_groups[index] += 1;
                continue;
            }
            match wrap_with_services(key, part, services) {
                Ok(()) => {
                    tracing::debug!(group = index, key = %key, "wrapped data key");
                    healthy_groups[index] += 1;
                }
                Err(reason) => {
                    tracing::debug!(group = index, key = %key, %reason, "failed to wrap data key");
                    let failure = KeyFailure {
                        key: key.to_string(),
                        reason,
                    };
                    match mode {
                        EscrowMode::FailFast => {
                            parts.zeroize();
                            return Err(EscrowError {
                                failures: vec![(index, failure)],
                            }
                            .into());
                        }
                        EscrowMode::GroupQuorum => key.set_encrypted_key(String::new()),
                        EscrowMode::Strict => {}
                    }
                    failures.push((index, failure));
                }
            }
        }
    }
    parts.zeroize();

    if failures.is_empty() {
        tracing::info!(
            groups = group_count,
            keys = metadata.master_key_count(),
            "data key escrowed"
        );
        return Ok(());
    }

    let abort = match mode {
        EscrowMode::GroupQuorum => healthy_groups.contains(&0),
        _ => true,
    };
    if abort {
        return Err(EscrowError { failures }.into());
    }

    tracing::warn!(
        failed = failures.len(),
        "some master keys could not wrap the data key and were left without a wrapped copy"
    );
    Ok(())
}

fn wrap_with_services(
    key: &mut MasterKey,
    secret: &[u8],
    services: &[Arc<dyn KeyService>],
) -> std::result::Result<(), String> {
    let mut reasons = Vec::new();
    for service in services {
        match key.encrypt(secret, service.as_ref()) {
            Ok(()) => return Ok(()),
            Err(err) => reasons.push(err.to_string()),
        }
    }
    if reasons.is_empty() {
        reasons.push("no key services configured".to_string());
    }
    Err(reasons.join("\n"))
}

fn unwrap_with_services(
    key: &MasterKey,
    services: &[Arc<dyn KeyService>],
) -> std::result::Result<Vec<u8>, String> {
    let mut reasons = Vec::new();
    for service in services {
        match key.decrypt(service.as_ref()) {
            Ok(part) => return Ok(part),
            Err(err) => reasons.push(err.to_string()),
        }
    }
    if reasons.is_empty() {
        reasons.push("no key services configured".to_string());
    }
    Err(reasons.join("\n"))
}

/// Order a group's keys by key type: types listed in `order` first, in that
/// order, then everything else as stored.
pub fn sort_by_decryption_order<'a>(
    group: &'a [MasterKey],
    order: &[KeyType],
) -> Vec<&'a MasterKey> {
    let mut keys: Vec<&MasterKey> = group.iter().collect();
    keys.sort_by_key(|key| {
        order
            .iter()
            .position(|t| *t == key.key_type())
            .unwrap_or(order.len())
    });
    keys
}

/// Rebuild the data key from the master keys of `metadata`.
///
/// The result is not authenticated here; callers validate it against the
/// document MAC.
pub fn recover_data_key(
    metadata: &Metadata,
    services: &[Arc<dyn KeyService>],
    decryption_order: &[KeyType],
) -> Result<DataKey> {
    metadata.validate()?;

    let required = metadata.required_groups();
    let mut parts: Vec<Vec<u8>> = Vec::new();
    let mut reports = Vec::new();

    for (index, group) in metadata.key_groups.iter().enumerate() {
        if parts.len() >= required {
            break;
        }
        let mut report = GroupReport {
            index,
            recovered: false,
            failures: Vec::new(),
        };
        for key in sort_by_decryption_order(group, decryption_order) {
            tracing::debug!(group = index, key = %key, "trying master key");
            match unwrap_with_services(key, services) {
                Ok(part) => {
                    tracing::debug!(group = index, key = %key, "master key unwrapped data key");
                    parts.push(part);
                    report.recovered = true;
                    break;
                }
                Err(reason) => report.failures.push(KeyFailure {
                    key: key.to_string(),
                    reason,
                }),
            }
        }
        reports.push(report);
    }

    if parts.len() < required {
        parts.zeroize();
        return Err(GetDataKeyError {
            required,
            succeeded: reports.iter().filter(|r| r.recovered).count(),
            groups: reports,
        }
        .into());
    }

    let mut secret = if metadata.key_groups.len() > 1 {
        shamir::combine(&parts)?
    } else {
        std::mem::take(&mut parts[0])
    };
    parts.zeroize();

    let key = DataKey::from_bytes(&secret);
    secret.zeroize();
    let key = key?;
    tracing::info!(groups = reports.len(), "data key recovered");
    Ok(key)
}
