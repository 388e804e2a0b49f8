//! Primary side of the relay: watch one SQLite file, fingerprint its dump,
//! and release parked `/watch` requests when the content really changed.

pub mod change;
pub mod engine;
pub mod fingerprint;
pub mod registry;
pub mod server;
pub mod tls;
