//! Remote path resolution for file retrieval.

use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::host::HostDescriptor;
use crate::transport::Transport;

/// Fetches `src` from the target into `dst`.
///
/// Relative sources resolve against the target's workspace, since
/// that is where framed commands run. Absolute sources pass through.
pub fn fetch(
    transport: &dyn Transport,
    target: &HostDescriptor,
    src: &str,
    dst: &Path,
) -> Result<()> {
    let resolved = remote_join(&target.workspace, src);
    debug!(
        "fetching {}:{} -> {}",
        target.location,
        resolved,
        dst.display()
    );
    transport.fetch(target, &resolved, dst)
}

fn remote_join(workspace: &str, src: &str) -> String {
    if src.starts_with('/') || workspace.is_empty() {
        src.to_string()
    } else {
        format!("{}/{}", workspace.trim_end_matches('/'), src)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
