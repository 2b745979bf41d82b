/// Audit logging for ruleset mutations
///
/// Structured logging of every commit, abort and restore outcome, so the
/// history of who changed the ruleset (and whether the engine accepted it)
/// survives process restarts.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CommitBatch,
    AbortBatch,
    RestoreScript,
    FlushRules,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates a new audit log instance
    ///
    /// # Errors
    ///
    /// Returns `Err` if the state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Appends an event to the audit log as one JSON object per line
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be opened or written
    pub fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    pub fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = std::fs::read_to_string(&self.log_path)?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

/// Logs a committed (or rejected) batch
pub fn log_commit(table: Option<&str>, messages: usize, success: bool, error: Option<String>) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(
            EventType::CommitBatch,
            success,
            serde_json::json!({
                "table": table,
                "messages": messages,
            }),
            error,
        );

        if let Err(e) = audit.log(&event) {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Logs a script restore outcome
pub fn log_restore(path: &str, success: bool, error: Option<String>) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(
            EventType::RestoreScript,
            success,
            serde_json::json!({ "path": path }),
            error,
        );

        if let Err(e) = audit.log(&event) {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Logs a flush operation
pub fn log_flush(table: &str, chain: Option<&str>, success: bool, error: Option<String>) {
    if let Ok(audit) = AuditLog::new() {
        let event = AuditEvent::new(
            EventType::FlushRules,
            success,
            serde_json::json!({
                "table": table,
                "chain": chain,
            }),
            error,
        );

        if let Err(e) = audit.log(&event) {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_creation() {
        let event = AuditEvent::new(
            EventType::CommitBatch,
            true,
            serde_json::json!({"messages": 5}),
            None,
        );

        assert!(event.success);
        assert!(event.error.is_none());
        assert_eq!(event.details["messages"], 5);
    }

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::RestoreScript,
            false,
            serde_json::json!({"path": "/tmp/rules.save"}),
            Some("save script line 3: unknown policy `MAYBE`".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("restore_script"));
        assert!(json.contains("unknown policy"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2026-01-01T00:00:00Z","event_type":"commit_batch","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert!(matches!(event.event_type, EventType::CommitBatch));
    }
}
