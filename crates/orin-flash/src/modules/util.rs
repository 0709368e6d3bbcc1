use std::fs;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::{ExecCtx, privileged_cmd};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

/// True only if the directory exists and holds at least one entry.
pub fn dir_non_empty(p: &Path) -> bool {
    fs::read_dir(p)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Unpacks an archive via the external `tar` tool, preserving permissions.
/// `privileged` routes through sudo when not already root; rootfs trees are
/// root-owned after vendor extraction.
pub fn extract_tarball(ctx: &ExecCtx, archive: &Path, dest: &Path, privileged: bool) -> Result<()> {
    if !archive.is_file() {
        return Err(Error::msg(format!(
            "archive not found: {}",
            archive.display()
        )));
    }
    let mut cmd = if privileged {
        privileged_cmd("tar")
    } else {
        Command::new("tar")
    };
    cmd.arg("-xpf").arg(archive).arg("-C").arg(dest);
    ctx.run_cmd(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_non_empty_distinguishes_empty_and_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!dir_non_empty(dir.path().join("missing").as_path()));
        assert!(!dir_non_empty(dir.path()));
        fs::write(dir.path().join("f"), "x").expect("write");
        assert!(dir_non_empty(dir.path()));
    }

    #[test]
    fn write_text_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = dir.path().join("a/b/c.txt");
        write_text(&p, "hello").expect("write");
        assert_eq!(fs::read_to_string(&p).expect("read"), "hello");
    }
}
