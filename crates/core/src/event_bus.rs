//! Activity bus: trait for emitting flow activity from any module.
//!
//! The flow engine accepts an `Arc<dyn EventSink>` and reports every cursor
//! milestone (enrollment, sends, branch resolution, terminal states) through
//! it. Deployments route these records to the campaign activity log.

use crate::types::{ActivityRecord, ActivityType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting activity records.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: ActivityRecord);
}

/// No-op sink for tests and deployments that don't keep an activity log.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _record: ActivityRecord) {}
}

/// Writes every record to the `activity` tracing target.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, record: ActivityRecord) {
        tracing::info!(
            target: "activity",
            activity = ?record.activity,
            campaign_id = %record.campaign_id,
            flow_id = %record.flow_id,
            lead_id = %record.lead_id,
            node_id = record.node_id.as_deref().unwrap_or(""),
            detail = %record.detail,
            "Flow activity"
        );
    }
}

/// In-memory sink that captures records for testing.
#[derive(Default)]
pub struct CaptureSink {
    records: Mutex<Vec<ActivityRecord>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn count_type(&self, activity: ActivityType) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.activity == activity)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, record: ActivityRecord) {
        self.records.lock().push(record);
    }
}

/// Convenience builder for creating an `ActivityRecord` with minimal boilerplate.
pub fn make_activity(
    activity: ActivityType,
    campaign_id: Uuid,
    flow_id: Uuid,
    lead_id: impl Into<String>,
    node_id: Option<String>,
    timestamp: DateTime<Utc>,
) -> ActivityRecord {
    ActivityRecord {
        activity_id: Uuid::new_v4(),
        activity,
        campaign_id,
        flow_id,
        lead_id: lead_id.into(),
        node_id,
        detail: serde_json::Value::Null,
        timestamp,
    }
}

/// Convenience: create a no-op sink for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
