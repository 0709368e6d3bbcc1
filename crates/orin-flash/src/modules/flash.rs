use std::path::Path;
use std::process::Command;

use orin_flash_macros::{Module, Stage};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::executor::{BestEffort, ExecCtx, privileged_cmd};
use crate::modules::util;

pub const EXPORTS_PATH: &str = "/etc/exports.d/orin-flash.exports";

/// Extracts the board name from `nvautoflash.sh --print_boardid` output. The
/// tool prints progress noise followed by a final `<board> found.` line; the
/// board name is that line minus the 7-character ` found.` suffix.
pub fn parse_board_id(output: &str) -> Option<String> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    if !line.is_ascii() || line.len() <= 7 {
        return None;
    }
    let board = line[..line.len() - 7].trim();
    if board.is_empty() {
        return None;
    }
    Some(board.to_string())
}

/// NFS exports for the two trees the initrd flash tool serves to the target:
/// the rootfs itself and the flashing images directory.
pub fn exports_file(rootfs_dir: &Path, images_dir: &Path) -> String {
    format!(
        "{} *(rw,sync,insecure,no_root_squash)\n{} *(rw,sync,insecure,no_root_squash)\n",
        rootfs_dir.display(),
        images_dir.display()
    )
}

#[Stage(
    id = "flash.recovery",
    module = "flash",
    phase = "preflight",
    label = "Check recovery mode",
    gate = "flash",
    after = ["core.init", "rootfs:bootsvc?"],
    provides = ["flash:recovery"]
)]
pub struct RecoveryCheckStage;

impl RecoveryCheckStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let bsp = &cfg.workspace.bsp_dir;
        ctx.log("querying for a board in recovery mode");
        let mut cmd = privileged_cmd("./nvautoflash.sh");
        cmd.arg("--print_boardid").current_dir(bsp);
        let out = ctx.run_cmd_capture(cmd)?;
        let text = String::from_utf8_lossy(&out.stdout);

        let Some(board) = parse_board_id(&text) else {
            return Err(Error::msg(
                "no board detected in recovery mode; hold the FC REC pin to GND \
                 while powering on, connect USB-C to the host, and retry",
            ));
        };
        if !cfg.profile.flash.boards.iter().any(|b| b == &board) {
            return Err(Error::msg(format!(
                "detected board '{board}' is not a supported target ({})",
                cfg.profile.flash.boards.join(", ")
            )));
        }
        ctx.log(&format!("detected '{board}' in recovery mode"));
        Ok(())
    }
}

#[Stage(
    id = "flash.exports",
    module = "flash",
    phase = "flash",
    label = "Publish NFS exports",
    gate = "flash",
    after = ["flash:recovery"],
    provides = ["flash:exports"]
)]
pub struct NfsExportsStage;

impl NfsExportsStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let ws = &cfg.workspace;
        let images_dir = ws.flash_images_dir();

        let mut mkdir = privileged_cmd("mkdir");
        mkdir.arg("-p").arg(&images_dir);
        ctx.run_cmd(mkdir)?;

        // Written locally first, then installed with privileges; the local
        // copy doubles as a record of what the host is exporting.
        let local = ws.root.join("orin-flash.exports");
        util::write_text(&local, &exports_file(&ws.rootfs_dir, &images_dir))?;

        let mut mkdir = privileged_cmd("mkdir");
        mkdir.arg("-p").arg("/etc/exports.d");
        ctx.run_cmd(mkdir)?;

        let mut cp = privileged_cmd("cp");
        cp.arg(&local).arg(EXPORTS_PATH);
        ctx.run_cmd(cp)?;

        let mut exportfs = privileged_cmd("exportfs");
        exportfs.arg("-ra");
        ctx.run_cmd(exportfs)?;

        let mut nfs = privileged_cmd("systemctl");
        nfs.args(["start", "nfs-server"]);
        ctx.run_cmd(nfs)?;

        ctx.log(&format!("exports published at {EXPORTS_PATH}"));
        Ok(())
    }
}

#[Stage(
    id = "flash.run",
    module = "flash",
    phase = "flash",
    label = "Flash NVMe over USB",
    gate = "flash",
    after = ["flash:exports"],
    provides = ["flash:flashed"]
)]
pub struct FlashRunStage;

impl FlashRunStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let target = &cfg.profile.flash;

        let mut stop = privileged_cmd("systemctl");
        stop.args(["stop", &target.restore_service]);
        if let BestEffort::Skipped(reason) = ctx.run_cmd_best_effort(stop) {
            ctx.log(&format!(
                "could not stop {} ({reason}); continuing",
                target.restore_service
            ));
        }

        let mut fw = Command::new("systemctl");
        fw.args(["is-active", "--quiet", "firewalld"]);
        if matches!(ctx.run_cmd_capture(fw), Ok(out) if out.status.success()) {
            ctx.warn(&format!(
                "firewalld is active; NFS traffic on {} may be blocked during flashing",
                target.interface
            ));
        }

        let mut cmd = privileged_cmd("./tools/kernel_flash/l4t_initrd_flash.sh");
        cmd.current_dir(&cfg.workspace.bsp_dir)
            .arg("--external-device")
            .arg(&target.external_device)
            .args(["-c", "tools/kernel_flash/flash_l4t_t234_nvme.xml"])
            .args(["-p", "-c bootloader/generic/cfg/flash_t234_qspi.xml"])
            .arg("--showlogs")
            .arg("--network")
            .arg(&target.interface)
            .args(["jetson-orin-nano-devkit", "internal"]);
        ctx.run_cmd(cmd)?;
        ctx.log("flashing finished; the board reboots into the new system");
        Ok(())
    }
}

#[Stage(
    id = "flash.cleanup",
    module = "flash",
    phase = "cleanup",
    label = "Restore host services",
    gate = "flash",
    after = ["flash:flashed"],
    provides = ["flash:cleanup"]
)]
pub struct CleanupStage;

impl CleanupStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let service = &cfg.profile.flash.restore_service;
        let mut start = privileged_cmd("systemctl");
        start.args(["start", service]);
        match ctx.run_cmd_best_effort(start) {
            BestEffort::Completed => ctx.log(&format!("{service} restored")),
            BestEffort::Skipped(reason) => {
                ctx.log(&format!("{service} not restored ({reason})"))
            }
        }
        Ok(())
    }
}

#[Module(
    id = "flash",
    gate = "flash",
    tasks = [RecoveryCheckStage, NfsExportsStage, FlashRunStage, CleanupStage]
)]
pub struct FlashModule;
