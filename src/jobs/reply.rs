use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an agent sent back for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "output", rename_all = "snake_case")]
pub enum ReplyPayload {
    Success(String),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub job_id: Uuid,
    pub agent_id: String,
    pub payload: ReplyPayload,
    pub received_at: DateTime<Utc>,
}

impl AgentReply {
    /// Build a reply stamped with the current time as its arrival time.
    pub fn new(job_id: Uuid, agent_id: impl Into<String>, payload: ReplyPayload) -> Self {
        Self {
            job_id,
            agent_id: agent_id.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Per-agent outcome of a coordinator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "output", rename_all = "snake_case")]
pub enum AgentResult {
    Success(String),
    Failure(String),
    Timeout,
}

impl AgentResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentResult::Success(_))
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            AgentResult::Success(out) | AgentResult::Failure(out) => Some(out),
            AgentResult::Timeout => None,
        }
    }
}

impl From<ReplyPayload> for AgentResult {
    fn from(payload: ReplyPayload) -> Self {
        match payload {
            ReplyPayload::Success(out) => AgentResult::Success(out),
            ReplyPayload::Failure(msg) => AgentResult::Failure(msg),
        }
    }
}

impl std::fmt::Display for AgentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentResult::Success(_) => write!(f, "success"),
            AgentResult::Failure(_) => write!(f, "failure"),
            AgentResult::Timeout => write!(f, "timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_result_wire_shape() {
        assert_eq!(
            serde_json::to_value(AgentResult::Success("hi".into())).unwrap(),
            json!({"status": "success", "output": "hi"})
        );
        assert_eq!(
            serde_json::to_value(AgentResult::Timeout).unwrap(),
            json!({"status": "timeout"})
        );
    }

    #[test]
    fn payload_converts_to_result() {
        assert_eq!(
            AgentResult::from(ReplyPayload::Failure("boom".into())),
            AgentResult::Failure("boom".into())
        );
        assert_eq!(AgentResult::Timeout.output(), None);
        assert_eq!(AgentResult::Success("x".into()).to_string(), "success");
    }
}
