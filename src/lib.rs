pub mod agent;
pub mod api;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod node;
pub mod shutdown;
pub mod targeting;
pub mod transport;
