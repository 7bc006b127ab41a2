//! Audit log for membership changes and rejected verifications.

use hiera_types::{now_millis, ChannelId, PublicKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of audit entries kept in memory.
const MAX_ENTRIES: usize = 10_000;

/// Kinds of membership events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Channel registered.
    ChannelCreated,
    /// Channel removed.
    ChannelRemoved,
    /// Organization added to a channel.
    OrganizationAdded,
    /// Validator added to a channel.
    ValidatorAdded,
    /// Identity revoked.
    IdentityRevoked,
    /// A membership change was rejected.
    ChangeRejected,
    /// A signature or identity failed verification.
    VerificationRejected,
}

/// A stored audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic entry id.
    pub id: u64,
    /// Unix milliseconds.
    pub timestamp: u64,
    /// Event kind.
    pub event_type: AuditEventType,
    /// Affected channel.
    pub channel: ChannelId,
    /// Affected key, when the event concerns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<PublicKey>,
    /// Free-form detail.
    pub detail: String,
}

/// Bounded, thread-safe audit log. The oldest entries are dropped first.
#[derive(Debug)]
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    next_id: AtomicU64,
    max_entries: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// Creates an audit log with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }

    /// Creates an audit log holding at most `max_entries`.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries.min(MAX_ENTRIES))),
            next_id: AtomicU64::new(1),
            max_entries: max_entries.max(1),
        }
    }

    /// Records an event.
    pub fn record(
        &self,
        event_type: AuditEventType,
        channel: &ChannelId,
        subject: Option<PublicKey>,
        detail: impl Into<String>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: now_millis(),
            event_type,
            channel: channel.clone(),
            subject,
            detail: detail.into(),
        };

        let mut entries = self.entries.write();
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry.clone());

        tracing::info!(
            event_type = ?entry.event_type,
            channel = %entry.channel,
            detail = %entry.detail,
            "membership audit event"
        );

        entry
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Entries affecting `channel`.
    pub fn for_channel(&self, channel: &ChannelId) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| &e.channel == channel)
            .cloned()
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let log = AuditLog::new();
        let main: ChannelId = "main".into();
        let other: ChannelId = "other".into();
        log.record(AuditEventType::ChannelCreated, &main, None, "created");
        log.record(AuditEventType::ChannelCreated, &other, None, "created");

        assert_eq!(log.len(), 2);
        assert_eq!(log.for_channel(&main).len(), 1);
        assert_eq!(log.recent(1)[0].channel, other);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = AuditLog::with_capacity(3);
        let main: ChannelId = "main".into();
        for i in 0..5 {
            log.record(AuditEventType::ValidatorAdded, &main, None, format!("{i}"));
        }
        let entries = log.recent(10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].detail, "2");
        assert_eq!(entries[0].id, 3);
    }
}
