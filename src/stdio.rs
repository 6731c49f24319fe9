//! Standard input/output as a single bidirectional byte stream.
//!
//! Used by the client when no listen address is configured, e.g. as an SSH
//! `ProxyCommand`. Tokio's stdin runs its blocking reads on a dedicated
//! task, so a session winding down abandons a pending read cooperatively
//! instead of blocking shutdown.

use crate::session::{LocalReader, LocalWriter};

/// Wrap the process's stdin/stdout as session-compatible halves.
#[must_use]
pub fn stdio() -> (LocalReader, LocalWriter) {
    (
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
    )
}
