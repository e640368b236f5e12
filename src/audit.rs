//! Audit events for document operations.
//!
//! A [`Session`](crate::session::Session) reports every top-level operation
//! to the [`Auditor`] it was built with. Nothing is recorded unless an
//! auditor is supplied.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Encrypt,
    Decrypt,
    Rotate,
    UpdateKeys,
    Set,
    Unset,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditAction::Encrypt => "encrypt",
            AuditAction::Decrypt => "decrypt",
            AuditAction::Rotate => "rotate",
            AuditAction::UpdateKeys => "update_keys",
            AuditAction::Set => "set",
            AuditAction::Unset => "unset",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Document the operation touched, when known.
    pub file: Option<String>,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, file: Option<&Path>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            file: file.map(|p| p.display().to_string()),
            success: true,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

pub trait Auditor: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits events through `tracing` under the `sops::audit` target.
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "sops::audit",
            timestamp = %event.timestamp,
            action = %event.action,
            file = ?event.file,
            success = event.success,
            detail = ?event.detail,
            "audit"
        );
    }
}

/// Keeps events in memory.
#[derive(Default, Clone)]
pub struct MemoryAuditor {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Auditor for MemoryAuditor {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
