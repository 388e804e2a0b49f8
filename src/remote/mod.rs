// ABOUTME: Everything the replica needs to talk to a primary
// ABOUTME: HTTP client plus classification of transport failures

pub mod client;
pub mod diagnose;

pub use client::{ClientOptions, PollOutcome, UpstreamClient};
pub use diagnose::FailureCause;
