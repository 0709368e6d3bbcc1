use std::path::{Path, PathBuf};
use std::process::Command;

use orin_flash_macros::{Module, Stage};
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, privileged_cmd};
use crate::modules::util;
use crate::workspace::ensure_within_root;

#[Stage(
    id = "rootfs.overlay",
    module = "rootfs",
    phase = "prepare",
    label = "Apply rootfs overlay",
    gate = "overlay",
    after = ["fetch:extracted"],
    provides = ["rootfs:overlay"]
)]
pub struct OverlayStage;

impl OverlayStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let overlay = cfg
            .overlay
            .as_deref()
            .ok_or_else(|| Error::msg("overlay stage planned without an overlay archive"))?;
        ctx.log(&format!(
            "overlaying {} onto {}",
            overlay.display(),
            cfg.workspace.rootfs_dir.display()
        ));
        util::extract_tarball(ctx, overlay, &cfg.workspace.rootfs_dir, true)
    }
}

#[Stage(
    id = "rootfs.binaries",
    module = "rootfs",
    phase = "prepare",
    label = "Apply NVIDIA binaries",
    gate = "fetch",
    after = ["fetch:extracted", "rootfs:overlay?"],
    provides = ["rootfs:binaries"]
)]
pub struct ApplyBinariesStage;

impl ApplyBinariesStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let bsp = &cfg.workspace.bsp_dir;
        if !bsp.join("apply_binaries.sh").is_file() {
            return Err(Error::msg(format!(
                "apply_binaries.sh not found in {} (BSP tree incomplete?)",
                bsp.display()
            )));
        }

        if !cfg.force_container {
            let mut cmd = privileged_cmd("./apply_binaries.sh");
            cmd.current_dir(bsp);
            match ctx.run_cmd(cmd) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // Native runs fail on hosts without aarch64 binfmt/qemu
                    // support; the containerized path carries its own.
                    ctx.warn(&format!(
                        "native apply_binaries.sh failed ({e}); retrying in a container"
                    ));
                }
            }
        } else {
            ctx.log("container run forced (-C), skipping native apply_binaries.sh");
        }

        let runtime = detect_container_runtime(ctx)?;
        ctx.log(&format!("using container runtime '{runtime}'"));
        let mut cmd = privileged_cmd(&runtime);
        cmd.args(["run", "--rm", "--privileged"])
            .arg("-v")
            .arg(format!("{}:/l4t", bsp.display()))
            .args(["-w", "/l4t", "ubuntu:22.04", "./apply_binaries.sh"]);
        ctx.run_cmd(cmd)
    }
}

/// Picks the first working container runtime, preferring podman.
fn detect_container_runtime(ctx: &ExecCtx) -> Result<String> {
    for rt in ["podman", "docker"] {
        let mut cmd = Command::new(rt);
        cmd.arg("--version");
        if let Ok(out) = ctx.run_cmd_capture(cmd) {
            if out.status.success() {
                return Ok(rt.to_string());
            }
        }
    }
    Err(Error::msg(
        "no container runtime found; install podman or docker to run apply_binaries.sh in a container",
    ))
}

#[Stage(
    id = "rootfs.modules",
    module = "rootfs",
    phase = "prepare",
    label = "Verify kernel modules",
    gate = "fetch",
    after = ["rootfs:binaries"],
    provides = ["rootfs:modules"]
)]
pub struct KernelModulesStage;

impl KernelModulesStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let ws = &cfg.workspace;
        ensure_kernel_modules(ctx, &ws.kernel_pkg_dir(), &ws.rootfs_dir, &ws.root, true)
    }
}

/// A populated `lib/modules` is the one signal apply_binaries.sh completed;
/// a rootfs flashed without it boots to a console with no networking. When
/// empty, re-extracts the BSP kernel packages over the rootfs and re-checks.
pub fn ensure_kernel_modules(
    ctx: &ExecCtx,
    kernel_pkg_dir: &Path,
    rootfs_dir: &Path,
    root: &Path,
    privileged: bool,
) -> Result<()> {
    let modules_dir = rootfs_dir.join("lib/modules");
    if util::dir_non_empty(&modules_dir) {
        ctx.log(&format!("{} is populated", modules_dir.display()));
        return Ok(());
    }
    ctx.warn(&format!(
        "{} is empty; repopulating from BSP kernel packages",
        modules_dir.display()
    ));

    if modules_dir.exists() {
        ensure_within_root(root, &modules_dir)?;
        let mut cmd = if privileged {
            privileged_cmd("rm")
        } else {
            Command::new("rm")
        };
        cmd.arg("-rf").arg(&modules_dir);
        ctx.run_cmd(cmd)?;
    }

    let packages = kernel_packages(kernel_pkg_dir)?;
    if packages.is_empty() {
        return Err(Error::msg(format!(
            "no kernel packages found under {}; the BSP tree cannot repopulate lib/modules",
            kernel_pkg_dir.display()
        )));
    }
    for pkg in &packages {
        ctx.log(&format!("extracting {}", pkg.display()));
        util::extract_tarball(ctx, pkg, rootfs_dir, privileged)?;
    }

    if !util::dir_non_empty(&modules_dir) {
        return Err(Error::msg(format!(
            "{} is still empty after extracting {} kernel package(s); \
             the flashed system would boot without drivers",
            modules_dir.display(),
            packages.len()
        )));
    }
    Ok(())
}

/// Kernel/initrd support packages shipped in the BSP `kernel/` directory.
pub fn kernel_packages(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = regex::Regex::new(r"(?i)^(kernel|initrd)[a-z0-9._-]*\.(tbz2|tar\.bz2)$")?;
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if pattern.is_match(name) {
                found.push(entry.into_path());
            }
        }
    }
    found.sort();
    Ok(found)
}

#[Module(
    id = "rootfs",
    gate = "fetch",
    tasks = [OverlayStage, ApplyBinariesStage, KernelModulesStage]
)]
pub struct RootfsModule;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn kernel_packages_matches_bsp_naming() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [
            "kernel_supplements.tbz2",
            "kernel-jammy.tar.bz2",
            "initrd_pkg.tbz2",
            "Image",
            "dtc",
            "kernel_notes.txt",
        ] {
            fs::write(dir.path().join(name), "x").expect("write");
        }
        let pkgs = kernel_packages(dir.path()).expect("scan");
        let names: Vec<_> = pkgs
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                "initrd_pkg.tbz2",
                "kernel-jammy.tar.bz2",
                "kernel_supplements.tbz2"
            ]
        );
    }

    #[test]
    fn kernel_packages_ignores_subdirectories() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("dtb")).expect("mkdir");
        fs::write(dir.path().join("dtb").join("kernel_extra.tbz2"), "x").expect("write");
        let pkgs = kernel_packages(dir.path()).expect("scan");
        assert!(pkgs.is_empty());
    }

    #[test]
    fn kernel_packages_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pkgs = kernel_packages(&dir.path().join("missing")).expect("scan");
        assert!(pkgs.is_empty());
    }
}
