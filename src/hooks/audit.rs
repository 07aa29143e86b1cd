use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::Registry;
use crate::{db::models::UserId, error::EmptyResult, util::get_uuid};

/// The audit event families every mutation logs
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GroupCreate,
    GroupDelete,
    GroupModifyUsers,
    GroupModifyType,
    GroupUnmanage,
    RoleGroupModify,
    AppCreate,
    AppDelete,
    TagCreate,
    TagDelete,
    TagModify,
    AccessCreate,
    AccessApprove,
    AccessReject,
    RoleRequestCreate,
    RoleRequestApprove,
    RoleRequestReject,
    GroupRequestCreate,
    GroupRequestApprove,
    GroupRequestReject,
    UserDelete,
}

/// Envelope handed to every audit sink after the surrounding commit.
/// Carries who acted, on what, and why, plus a free-form payload.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: NaiveDateTime,
    pub actor_id: String,
    pub actor_email: Option<String>,
    pub target_type: &'static str,
    pub target_id: String,
    pub target_name: Option<String>,
    pub action: &'static str,
    pub reason: Option<String>,
    pub payload: Value,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(event_type: EventType, target_type: &'static str, target_id: String, action: &'static str) -> Self {
        Self {
            id: get_uuid(),
            event_type,
            timestamp: Utc::now().naive_utc(),
            actor_id: String::from("system"),
            actor_email: None,
            target_type,
            target_id,
            target_name: None,
            action,
            reason: None,
            payload: Value::Null,
            metadata: Value::Null,
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: Option<&UserId>, actor_email: Option<String>) -> Self {
        if let Some(id) = actor_id {
            self.actor_id = id.to_string();
        }
        self.actor_email = actor_email;
        self
    }

    #[must_use]
    pub fn target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if !reason.is_empty() {
            self.reason = Some(reason);
        }
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

pub trait AuditSink: Send + Sync {
    /// Called after the mutation's commit; must be quick and must not fail
    /// the caller.
    fn audit_event_logged(&self, event: &AuditEvent) -> EmptyResult;
}

static SINKS: Registry<dyn AuditSink> = Registry::new("audit");

pub fn register(sink: Arc<dyn AuditSink>) {
    SINKS.register(sink);
}

pub fn log_event(event: AuditEvent) {
    SINKS.dispatch("audit_event_logged", |h| h.audit_event_logged(&event));
}

/// The built-in sink writes the envelope as one JSON line on a dedicated
/// log target, the shape SIEM forwarders expect.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn audit_event_logged(&self, event: &AuditEvent) -> EmptyResult {
        info!(target: "accessward::audit", "{}", serde_json::to_string(event)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_serialize_with_snake_case_event_types() {
        let event = AuditEvent::new(EventType::GroupModifyUsers, "group", String::from("g1"), "modified")
            .target_name("Chat-Admins")
            .reason("ticket ACC-1");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"group_modify_users\""));
        assert!(json.contains("\"Chat-Admins\""));
        assert!(json.contains("\"ticket ACC-1\""));
    }
}
