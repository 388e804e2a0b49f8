// ABOUTME: Library root for sqlite-relay
// ABOUTME: Replicates one SQLite file from a primary to read-only replicas over HTTP

pub mod commands;
pub mod config;
pub mod remote;
pub mod replica;
pub mod utils;
