pub mod job;
pub mod registry;
pub mod reply;

pub use job::Job;
pub use registry::{JobRegistry, JobStatus, JobSummary};
pub use reply::{AgentReply, AgentResult, ReplyPayload};
