pub mod batch;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod retry;
pub mod router;
pub mod sinks;
pub mod source;
