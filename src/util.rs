//! Small cross-cutting helpers: string formatting and the atomic-write
//! discipline used throughout the vault, health store, PID file, and
//! project-association store.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Truncate a string to at most `max_chars` characters, appending "..."
/// if truncated. Used for profile descriptions and identity labels in
/// CLI table output.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Write `contents` to `path` atomically: write to a sibling `.tmp`
/// file with the given Unix mode, fsync, then rename over the
/// destination. On non-Unix platforms the mode is ignored.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = sibling_tmp_path(path);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        set_mode(&file, mode)?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn sibling_tmp_path(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "tmp".to_string());
    path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()))
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Create a directory (and parents) with the given Unix mode. Used for
/// the PID file's parent directories (0700 per spec).
pub fn create_dir_with_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }
    Ok(())
}
