//! Session state and outbound status types.

use serde::{Deserialize, Serialize};

/// Lifecycle of one document sync session.
///
/// Transitions: `Stopped → Starting → Online ⇄ Offline → Resyncing → Online`.
/// `Starting` establishes or recovers the anchor before any segment is
/// accepted; `Resyncing` drains the offline queue through the same dispatch
/// path as live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Stopped,
    Starting,
    Online,
    Offline,
    Resyncing,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Resyncing => "resyncing",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of session health, broadcast over a watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSessionState {
    pub mode: SyncMode,
    pub queue_depth: usize,
    pub dead_letters: usize,
    /// Epoch millis of the last successful dispatch
    pub last_synced_at: Option<i64>,
    pub last_error: Option<String>,
}

impl Default for SyncSessionState {
    fn default() -> Self {
        Self {
            mode: SyncMode::Stopped,
            queue_depth: 0,
            dead_letters: 0,
            last_synced_at: None,
            last_error: None,
        }
    }
}

/// Discriminant of an outbound status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    SyncStarted,
    SyncOffline,
    SyncOnline,
    SyncSuccess,
    SyncError,
}

/// One event on the outbound status stream.
///
/// Purely observational; consumers must never use it for control. A
/// detected sequence gap does not change the session mode, it rides along
/// on the next event as `discontinuity`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub discontinuity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_wire_format() {
        let event = StatusEvent {
            kind: StatusKind::SyncSuccess,
            session_id: "session-1".into(),
            queue_depth: Some(3),
            error: None,
            discontinuity: false,
        };
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains(r#""type":"sync_success""#));
        assert!(json.contains(r#""sessionId":"session-1""#));
        assert!(json.contains(r#""queueDepth":3"#));
        assert!(!json.contains("error"));
        assert!(!json.contains("discontinuity"));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(SyncMode::Resyncing.to_string(), "resyncing");
        assert_eq!(SyncMode::Online.as_str(), "online");
    }
}
