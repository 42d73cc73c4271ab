//! Pluggable policies that shape request execution: load balancing, retries
//! and speculative execution.

pub mod load_balancing;
pub mod retry;
pub mod speculative;
