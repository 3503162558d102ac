//! Security event sink.
//!
//! Audit calls are fire-and-forget: `log_event` returns nothing and
//! implementations must swallow their own failures so that auditing can never
//! change an authentication decision.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    LegacyOwnership,
    HashMigration,
    HashCollision,
    KeyLifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Blocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub category: AuditCategory,
    pub outcome: AuditOutcome,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

pub trait SecurityAudit: Send + Sync {
    fn log_event(&self, category: AuditCategory, outcome: AuditOutcome, details: Value);
}

/// Writes events to the `security_audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl SecurityAudit for TracingAudit {
    fn log_event(&self, category: AuditCategory, outcome: AuditOutcome, details: Value) {
        let event = SecurityEvent {
            category,
            outcome,
            details,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match outcome {
            AuditOutcome::Success => {
                tracing::info!(target: "security_audit", event = %payload, "security event")
            }
            AuditOutcome::Failure | AuditOutcome::Blocked => {
                tracing::warn!(target: "security_audit", event = %payload, "security event")
            }
        }
    }
}

/// Keeps events in memory. Used by tests and by hosts that forward events
/// elsewhere in batches.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<SecurityEvent>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, category: AuditCategory, outcome: AuditOutcome) -> usize {
        self.events()
            .iter()
            .filter(|e| e.category == category && e.outcome == outcome)
            .count()
    }
}

impl SecurityAudit for RecordingAudit {
    fn log_event(&self, category: AuditCategory, outcome: AuditOutcome, details: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(SecurityEvent {
                category,
                outcome,
                details,
                timestamp: Utc::now(),
            });
        }
    }
}
