use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::version::ReleaseVersion;
use crate::workspace::Workspace;

fn default_base_url() -> String {
    "https://developer.nvidia.com/downloads/embedded/l4t".into()
}

fn default_interface() -> String {
    "usb0".into()
}

fn default_external_device() -> String {
    "nvme0n1p1".into()
}

fn default_boards() -> Vec<String> {
    vec![
        "jetson-orin-nano-devkit".into(),
        "jetson-orin-nano-devkit-super".into(),
    ]
}

fn default_restore_service() -> String {
    "ModemManager".into()
}

fn default_root_dir() -> String {
    "l4t".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadProfile {
    pub base_url: String,
    /// Optional pinned digests for the two release tarballs. When set, a
    /// pre-existing download is reused if it matches and a mismatch aborts.
    pub bsp_sha256: Option<String>,
    pub rootfs_sha256: Option<String>,
}

impl Default for DownloadProfile {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            bsp_sha256: None,
            rootfs_sha256: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlashTargetProfile {
    /// Network interface the initrd flash tool uses. The recovery-mode USB
    /// gadget shows up under this fixed name.
    pub interface: String,
    pub external_device: String,
    /// Board identifiers accepted by the recovery-state check.
    pub boards: Vec<String>,
    /// Host service stopped while flashing (it grabs the recovery-mode USB
    /// device otherwise) and restored during cleanup.
    pub restore_service: String,
}

impl Default for FlashTargetProfile {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            external_device: default_external_device(),
            boards: default_boards(),
            restore_service: default_restore_service(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceProfile {
    pub root_dir: String,
}

impl Default for WorkspaceProfile {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
        }
    }
}

/// Site-level overrides, loaded from an optional TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlashProfile {
    pub download: DownloadProfile,
    pub flash: FlashTargetProfile,
    pub workspace: WorkspaceProfile,
}

pub fn load_profile(path: &Path) -> Result<FlashProfile> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read profile {}: {e}", path.display())))?;
    let profile: FlashProfile = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
    Ok(profile)
}

/// What the operator asked for on the command line.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub fetch: bool,
    pub flash: bool,
    pub force_container: bool,
    pub overlay: Option<PathBuf>,
    pub version: Option<String>,
}

/// Immutable configuration for one run, built once from the CLI request and
/// the profile, then passed by reference into planning and execution. There
/// is no other configuration channel; stages read everything from here.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch: bool,
    pub flash: bool,
    pub force_container: bool,
    pub overlay: Option<PathBuf>,
    pub version: Option<ReleaseVersion>,
    pub profile: FlashProfile,
    pub workspace: Workspace,
}

impl PipelineConfig {
    pub fn new(req: PipelineRequest, profile: FlashProfile) -> Result<Self> {
        if !req.fetch && !req.flash {
            return Err(Error::msg(
                "nothing to do: pass -g to fetch/prepare, -f to flash, or both",
            ));
        }

        let version = match req.version.as_deref() {
            Some(raw) => Some(ReleaseVersion::parse(raw)?),
            None => None,
        };
        if req.fetch && version.is_none() {
            return Err(Error::msg("-g requires a release version (-v MAJOR.MINOR.PATCH)"));
        }

        if let Some(overlay) = req.overlay.as_deref() {
            if !req.fetch {
                return Err(Error::msg(
                    "-o has no effect without -g; the overlay is applied while preparing the rootfs",
                ));
            }
            if !overlay.is_file() {
                return Err(Error::msg(format!(
                    "overlay archive not found: {}",
                    overlay.display()
                )));
            }
        }

        let workspace = Workspace::resolve(&profile.workspace.root_dir)?;

        Ok(Self {
            fetch: req.fetch,
            flash: req.flash,
            force_container: req.force_container,
            overlay: req.overlay,
            version,
            profile,
            workspace,
        })
    }

    /// Gate predicate used by the stage/module macros.
    pub fn stage_enabled(&self, gate: &str) -> bool {
        match gate {
            "always" => true,
            "fetch" => self.fetch,
            "flash" => self.flash,
            "overlay" => self.fetch && self.overlay.is_some(),
            _ => false,
        }
    }

    /// The release version; only callable from fetch-gated stages, which the
    /// constructor guarantees a version for.
    pub fn release_version(&self) -> Result<ReleaseVersion> {
        self.version
            .ok_or_else(|| Error::msg("release version is not set"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_at_least_one_of_fetch_and_flash() {
        let err = PipelineConfig::new(PipelineRequest::default(), FlashProfile::default())
            .unwrap_err()
            .to_string();
        assert!(err.contains("nothing to do"), "unexpected err: {err}");
    }

    #[test]
    fn fetch_requires_a_version() {
        let req = PipelineRequest {
            fetch: true,
            ..Default::default()
        };
        let err = PipelineConfig::new(req, FlashProfile::default())
            .unwrap_err()
            .to_string();
        assert!(err.contains("-v"), "unexpected err: {err}");
    }

    #[test]
    fn overlay_without_fetch_is_rejected() {
        let req = PipelineRequest {
            flash: true,
            overlay: Some(PathBuf::from("overlay.tbz2")),
            ..Default::default()
        };
        let err = PipelineConfig::new(req, FlashProfile::default())
            .unwrap_err()
            .to_string();
        assert!(err.contains("-o"), "unexpected err: {err}");
        assert!(err.contains("-g"), "unexpected err: {err}");
    }

    #[test]
    fn flash_only_needs_no_version() {
        let req = PipelineRequest {
            flash: true,
            ..Default::default()
        };
        let cfg = PipelineConfig::new(req, FlashProfile::default()).expect("config");
        assert!(cfg.stage_enabled("flash"));
        assert!(!cfg.stage_enabled("fetch"));
        assert!(!cfg.stage_enabled("overlay"));
        assert!(cfg.stage_enabled("always"));
    }

    #[test]
    fn profile_defaults_cover_the_devkit_boards() {
        let profile = FlashProfile::default();
        assert_eq!(profile.flash.interface, "usb0");
        assert!(
            profile
                .flash
                .boards
                .iter()
                .any(|b| b == "jetson-orin-nano-devkit-super")
        );
    }

    #[test]
    fn profile_toml_overrides_defaults() {
        let profile: FlashProfile = toml::from_str(
            r#"
[download]
base_url = "https://mirror.example/l4t"

[flash]
interface = "usb1"
"#,
        )
        .expect("profile toml");
        assert_eq!(profile.download.base_url, "https://mirror.example/l4t");
        assert_eq!(profile.flash.interface, "usb1");
        assert_eq!(profile.workspace.root_dir, "l4t");
    }
}
