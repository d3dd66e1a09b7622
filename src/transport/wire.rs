use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodec;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{Job, ReplyPayload};

/// One line on the master/agent TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame an agent sends after connecting
    Hello { agent_id: String },
    Heartbeat,
    Job { job: Job },
    Reply {
        job_id: Uuid,
        agent_id: String,
        payload: ReplyPayload,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Line codec that refuses frames longer than `max_frame_len` bytes.
pub fn codec(max_frame_len: usize) -> LinesCodec {
    LinesCodec::new_with_max_length(max_frame_len)
}
