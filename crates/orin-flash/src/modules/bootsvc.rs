use std::fs;
use std::path::Path;

use orin_flash_macros::{Module, Stage};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, privileged_cmd};
use crate::modules::util;

pub const REL_SCRIPT: &str = "usr/local/bin/jetson-max-perf.sh";
pub const REL_UNIT: &str = "etc/systemd/system/jetson-max-perf.service";
pub const REL_WANTS_LINK: &str =
    "etc/systemd/system/multi-user.target.wants/jetson-max-perf.service";

/// The awk rendition of [`crate::power::select_highest_power_mode`], embedded
/// in the boot script. Kept as its own constant so tests can run it through
/// `awk` and hold it to the Rust reference.
pub const SELECTOR_AWK: &str = r#"
    match($0, /[Mm][Oo][Dd][Ee][ \t]*:?[ \t]*[0-9]+/) {
        m = substr($0, RSTART, RLENGTH)
        gsub(/[^0-9]/, "", m)
        last = m
        seen = 1
    }
    seen && match($0, /[0-9]+(\.[0-9]+)?[ \t]*[Ww]/) {
        w = substr($0, RSTART, RLENGTH)
        gsub(/[^0-9.]/, "", w)
        if (!has || w + 0 >= bw + 0) { bw = w; best = last; has = 1 }
    }
    END {
        if (has) print best
        else if (seen) print last
    }
"#;

/// First-boot script injected into the rootfs. The mode selection mirrors
/// [`crate::power::select_highest_power_mode`]: highest advertised wattage
/// wins, later modes win ties, and an undecidable mode list leaves the
/// device on its defaults instead of failing the boot.
pub fn boot_script() -> String {
    format!(
        r#"#!/bin/sh
# Selects the highest-wattage nvpmodel power mode and locks clocks.
set -u

if ! command -v nvpmodel >/dev/null 2>&1; then
    logger -t jetson-max-perf "nvpmodel not available; leaving power mode unchanged"
    exit 0
fi

BEST="$(nvpmodel -q --verbose 2>/dev/null | awk '{SELECTOR_AWK}')"

if [ -z "$BEST" ]; then
    logger -t jetson-max-perf "could not determine a power mode; leaving defaults"
    exit 0
fi

nvpmodel -m "$BEST" || logger -t jetson-max-perf "nvpmodel -m $BEST failed"
jetson_clocks || logger -t jetson-max-perf "jetson_clocks failed"
exit 0
"#
    )
}

pub fn service_unit() -> String {
    "[Unit]\n\
     Description=Select the highest nvpmodel power mode at boot\n\
     After=multi-user.target\n\
     \n\
     [Service]\n\
     Type=oneshot\n\
     ExecStart=/usr/local/bin/jetson-max-perf.sh\n\
     RemainAfterExit=yes\n\
     \n\
     [Install]\n\
     WantedBy=multi-user.target\n"
        .to_string()
}

/// Materializes the script, unit, and enablement symlink under `rootfs`.
/// Pure filesystem work so it can run against a staging tree.
pub fn install_into(rootfs: &Path) -> Result<()> {
    let script = rootfs.join(REL_SCRIPT);
    util::write_text(&script, &boot_script())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::msg(format!("chmod failed on {}: {e}", script.display())))?;
    }

    util::write_text(&rootfs.join(REL_UNIT), &service_unit())?;

    // systemd enablement without a running systemd: link the unit into the
    // default target's wants directory ourselves.
    let link = rootfs.join(REL_WANTS_LINK);
    if let Some(parent) = link.parent() {
        util::ensure_dir(parent)?;
    }
    #[cfg(unix)]
    {
        if link.symlink_metadata().is_ok() {
            fs::remove_file(&link)
                .map_err(|e| Error::msg(format!("failed to replace {}: {e}", link.display())))?;
        }
        std::os::unix::fs::symlink("/etc/systemd/system/jetson-max-perf.service", &link)
            .map_err(|e| Error::msg(format!("symlink failed at {}: {e}", link.display())))?;
    }
    Ok(())
}

#[Stage(
    id = "bootsvc.install",
    module = "bootsvc",
    phase = "prepare",
    label = "Install max-performance boot service",
    gate = "fetch",
    after = ["rootfs:modules"],
    provides = ["rootfs:bootsvc"]
)]
pub struct InstallStage;

impl InstallStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let ws = &cfg.workspace;

        // Build in a staging tree we own, then copy into the root-owned
        // rootfs with modes and the symlink preserved.
        let staging = ws.root.join("staging/bootsvc");
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .map_err(|e| Error::msg(format!("failed to clear {}: {e}", staging.display())))?;
        }
        install_into(&staging)?;

        let mut cmd = privileged_cmd("cp");
        cmd.arg("-a")
            .arg(format!("{}/.", staging.display()))
            .arg(&ws.rootfs_dir);
        ctx.run_cmd(cmd)?;
        ctx.log("jetson-max-perf service installed and enabled for multi-user.target");
        Ok(())
    }
}

#[Module(id = "bootsvc", gate = "fetch", tasks = [InstallStage])]
pub struct BootServiceModule;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::process::{Command, Stdio};

    #[test]
    fn install_lays_out_script_unit_and_symlink() {
        let dir = tempfile::tempdir().expect("tempdir");
        install_into(dir.path()).expect("install");

        let script = dir.path().join(REL_SCRIPT);
        let content = fs::read_to_string(&script).expect("script");
        assert!(content.starts_with("#!/bin/sh"));
        assert!(content.contains("nvpmodel -m \"$BEST\""));
        assert!(content.contains("jetson_clocks"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&script).expect("meta").permissions().mode();
            assert_eq!(mode & 0o111, 0o111, "script must be executable");
        }

        let unit = fs::read_to_string(dir.path().join(REL_UNIT)).expect("unit");
        assert!(unit.contains("Type=oneshot"));
        assert!(unit.contains("RemainAfterExit=yes"));
        assert!(unit.contains("WantedBy=multi-user.target"));

        #[cfg(unix)]
        {
            let target = fs::read_link(dir.path().join(REL_WANTS_LINK)).expect("link");
            assert_eq!(
                target,
                Path::new("/etc/systemd/system/jetson-max-perf.service")
            );
        }
    }

    #[test]
    fn install_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        install_into(dir.path()).expect("first install");
        install_into(dir.path()).expect("second install");
    }

    // Runs the shipped awk selector over a listing, returning the printed
    // mode id (None when it prints nothing).
    fn awk_selection(listing: &str) -> Option<u32> {
        let mut child = Command::new("awk")
            .arg(SELECTOR_AWK)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn awk");
        child
            .stdin
            .take()
            .expect("stdin")
            .write_all(listing.as_bytes())
            .expect("feed listing");
        let out = child.wait_with_output().expect("awk run");
        assert!(out.status.success(), "awk failed on {listing:?}");
        let text = String::from_utf8_lossy(&out.stdout);
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.parse().expect("mode id"))
        }
    }

    #[test]
    fn script_selector_agrees_with_the_reference() {
        if Command::new("awk").arg("--version").output().is_err() {
            eprintln!("skipping: awk not available");
            return;
        }

        let listings = [
            "Mode 0: 7W\nMode 1: 25W\nMode 2: 15W\n",
            "Mode 0: 7W\nMode 1: 15W\nMode 2: 15W\n",
            "NV Power Mode: MODE_15W\nPOWER MODEL: Mode 0 (7W)\nPOWER MODEL: Mode 1 (15W)\nPOWER MODEL: Mode 2 (25W MAXN SUPER)\n",
            "POWER MODEL: Mode 0 (MAXN)\n  budget 15W\nPOWER MODEL: Mode 1 (7W)\n",
            "Mode 0 MAXN\nMode 1 LOW\nMode 3 CUSTOM\n",
            "budget 99W\nMode 0: 7W\n",
            "",
            "no modes here, just text\n",
        ];
        for listing in listings {
            assert_eq!(
                awk_selection(listing),
                crate::power::select_highest_power_mode(listing).map(|s| s.id),
                "selectors disagree on {listing:?}"
            );
        }
    }

    #[test]
    fn script_never_hard_fails() {
        // A boot-time service that exits non-zero taints the boot; every
        // branch in the script must end in exit 0.
        let script = boot_script();
        assert!(!script.contains("exit 1"));
    }
}
