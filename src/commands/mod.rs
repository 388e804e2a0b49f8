// ABOUTME: Command implementations for the two relay roles
// ABOUTME: Exports watch (primary) and sync (replica)

pub mod sync;
pub mod watch;

pub use sync::sync;
pub use watch::watch;
