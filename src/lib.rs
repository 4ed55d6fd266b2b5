//! streamq - message queues for Rust services
//!
//! Two interchangeable engines behind one publish-subscribe contract:
//! an in-process bounded bus (`queue::memq`) and a durable consumer-group
//! runtime over Redis Streams (`queue::redisq`).

pub mod config;
pub mod middleware;
pub mod queue;
pub mod utils;
