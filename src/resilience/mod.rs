//! Resilience primitives: rate limiting and retry with backoff.

pub mod rate_limit;
pub mod retry;
