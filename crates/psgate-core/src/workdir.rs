use std::path::{Path, PathBuf};

use crate::config::ConfigSnapshot;
use crate::error::{PsgateError, Result};

/// Canonicalize and validate a requested working directory against the
/// allowed roots.
///
/// Absent paths pass through. With enforcement off, the only check is
/// existence. With enforcement on, the canonical path must sit under
/// one of `allowedWriteRoots` (compared component-wise, not by string
/// prefix, so `/tmp/abc` does not satisfy a root of `/tmp/ab`).
pub fn resolve_and_check(
    path: Option<&Path>,
    snapshot: &ConfigSnapshot,
) -> Result<Option<PathBuf>> {
    let Some(path) = path else {
        return Ok(None);
    };

    let canonical = std::fs::canonicalize(path)
        .map_err(|_| PsgateError::WorkingDirNotFound(path.display().to_string()))?;

    if !snapshot.security.enforce_working_directory {
        return Ok(Some(canonical));
    }

    for root in &snapshot.security.allowed_write_roots {
        let expanded = expand_root(root);
        // Roots are canonicalized too so symlinked temp dirs compare equal.
        let root_path = std::fs::canonicalize(&expanded).unwrap_or(expanded);
        if canonical.starts_with(&root_path) {
            return Ok(Some(canonical));
        }
    }

    Err(PsgateError::WorkingDirOutOfRoot(canonical.display().to_string()))
}

/// Expand `${TEMP}`-style placeholders in a configured root.
fn expand_root(root: &str) -> PathBuf {
    if let Some(rest) = root.strip_prefix("${TEMP}") {
        let mut p = std::env::temp_dir();
        let rest = rest.trim_start_matches(['/', '\\']);
        if !rest.is_empty() {
            p.push(rest);
        }
        return p;
    }
    if let Some(rest) = root.strip_prefix("${HOME}") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut p = PathBuf::from(home);
            let rest = rest.trim_start_matches(['/', '\\']);
            if !rest.is_empty() {
                p.push(rest);
            }
            return p;
        }
    }
    PathBuf::from(root)
}
