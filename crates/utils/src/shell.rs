use std::path::PathBuf;

/// Resolve an executable name against PATH. Absolute or relative paths that
/// exist are returned as-is.
pub fn resolve_executable_path_blocking(executable: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(executable);
    if candidate.components().count() > 1 && candidate.is_file() {
        return Some(candidate);
    }
    match which::which(executable) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::debug!("Executable '{}' not found on PATH: {}", executable, e);
            None
        }
    }
}
