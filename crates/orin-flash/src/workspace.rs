use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Host-side directory layout for one release. Everything lives under a
/// single workspace root; the vendor BSP tree extracts to the fixed
/// `Linux_for_Tegra` directory name its tarball carries.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub downloads_dir: PathBuf,
    pub bsp_dir: PathBuf,
    pub rootfs_dir: PathBuf,
}

impl Workspace {
    pub fn resolve(root_dir: &str) -> Result<Self> {
        let root_dir = root_dir.trim();
        if root_dir.is_empty() {
            return Err(Error::msg("workspace root_dir is empty"));
        }
        if Path::new(root_dir)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::msg(format!(
                "invalid workspace root_dir '{}' (contains '..')",
                root_dir
            )));
        }

        let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
        let pb = PathBuf::from(root_dir);
        let root = if pb.is_absolute() { pb } else { cwd.join(pb) };

        let downloads_dir = root.join("downloads");
        let bsp_dir = root.join("Linux_for_Tegra");
        let rootfs_dir = bsp_dir.join("rootfs");
        Ok(Self {
            root,
            downloads_dir,
            bsp_dir,
            rootfs_dir,
        })
    }

    pub fn init_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.downloads_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    /// Where the vendor BSP keeps its kernel/initrd packages.
    pub fn kernel_pkg_dir(&self) -> PathBuf {
        self.bsp_dir.join("kernel")
    }

    /// Kernel modules directory inside the prepared rootfs.
    pub fn modules_dir(&self) -> PathBuf {
        self.rootfs_dir.join("lib/modules")
    }

    /// Images directory the initrd flashing tool serves over NFS.
    pub fn flash_images_dir(&self) -> PathBuf {
        self.bsp_dir.join("tools/kernel_flash/images")
    }
}

/// Refuses to touch paths that escape the workspace root. Used before any
/// destructive operation on the rootfs tree.
pub fn ensure_within_root(root: &Path, target: &Path) -> Result<()> {
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let target_can = target
        .canonicalize()
        .unwrap_or_else(|_| target.to_path_buf());
    if !target_can.starts_with(&root_can) {
        return Err(Error::msg(format!(
            "refusing to touch '{}' (outside workspace root '{}')",
            target_can.display(),
            root_can.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_the_bsp_tree() {
        let ws = Workspace::resolve("l4t").expect("workspace");
        assert!(ws.root.ends_with("l4t"));
        assert_eq!(ws.bsp_dir, ws.root.join("Linux_for_Tegra"));
        assert_eq!(ws.rootfs_dir, ws.bsp_dir.join("rootfs"));
        assert_eq!(ws.modules_dir(), ws.rootfs_dir.join("lib/modules"));
    }

    #[test]
    fn rejects_parent_dir_roots() {
        assert!(Workspace::resolve("../elsewhere").is_err());
        assert!(Workspace::resolve("").is_err());
    }

    #[test]
    fn ensure_within_root_guards_escapes() {
        let root = PathBuf::from("/tmp/orin-flash-root");
        assert!(ensure_within_root(&root, &root.join("Linux_for_Tegra/rootfs")).is_ok());
        assert!(ensure_within_root(&root, Path::new("/etc")).is_err());
    }
}
