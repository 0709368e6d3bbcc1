use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use orin_flash_macros::{Module, Stage};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::modules::util;
use crate::version::ReleaseVersion;

pub fn bsp_archive_name(v: ReleaseVersion) -> String {
    format!("Jetson_Linux_R{v}_aarch64.tbz2")
}

pub fn rootfs_archive_name(v: ReleaseVersion) -> String {
    format!("Tegra_Linux_Sample-Root-Filesystem_R{v}_aarch64.tbz2")
}

/// Release artifacts live under a versioned directory whose name splits the
/// release differently from the file names: `r36_release_v4.4/release/...`.
pub fn release_url(base_url: &str, v: ReleaseVersion, file: &str) -> String {
    format!(
        "{}/r{}_release_v{}.{}/release/{}",
        base_url.trim_end_matches('/'),
        v.major,
        v.minor,
        v.patch,
        file
    )
}

fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streams `url` into `dest` (via a `.part` file renamed on success). A
/// pre-existing complete download is reused; when a pinned digest is given,
/// reuse requires a match and the final file is verified against it.
fn download(ctx: &ExecCtx, url: &str, dest: &Path, pinned_sha256: Option<&str>) -> Result<()> {
    if dest.is_file() {
        match pinned_sha256 {
            None => {
                ctx.log(&format!("reusing existing {} (unverified)", dest.display()));
                return Ok(());
            }
            Some(pin) => {
                let got = sha256_file_hex(dest)?;
                if got.eq_ignore_ascii_case(pin) {
                    ctx.log(&format!("reusing existing {} (digest ok)", dest.display()));
                    return Ok(());
                }
                ctx.warn(&format!(
                    "existing {} does not match the pinned digest; downloading again",
                    dest.display()
                ));
            }
        }
    }

    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::msg(format!("invalid download path {}", dest.display())))?;
    let part = dest.with_file_name(format!("{file_name}.part"));

    ctx.log(&format!("downloading {url}"));
    let client = reqwest::blocking::Client::builder()
        // No overall timeout: these tarballs are multi-gigabyte and run to
        // natural completion, like every other external step.
        .connect_timeout(Duration::from_secs(30))
        .build()?;
    let mut resp = client.get(url).send()?;
    if !resp.status().is_success() {
        return Err(Error::msg(format!(
            "download of {url} failed with status {}",
            resp.status()
        )));
    }

    let mut out = fs::File::create(&part)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", part.display())))?;
    let bytes = resp
        .copy_to(&mut out)
        .map_err(|e| Error::msg(format!("download of {url} failed mid-stream: {e}")))?;
    drop(out);

    if let Some(pin) = pinned_sha256 {
        let got = sha256_file_hex(&part)?;
        if !got.eq_ignore_ascii_case(pin) {
            let _ = fs::remove_file(&part);
            return Err(Error::msg(format!(
                "digest mismatch for {file_name}: expected {pin}, got {got}"
            )));
        }
    }

    fs::rename(&part, dest)
        .map_err(|e| Error::msg(format!("failed to move {} into place: {e}", part.display())))?;
    ctx.log(&format!("downloaded {file_name} ({bytes} bytes)"));
    Ok(())
}

fn downloads_path(cfg: &PipelineConfig, file: &str) -> PathBuf {
    cfg.workspace.downloads_dir.join(file)
}

#[Stage(
    id = "fetch.bsp",
    module = "fetch",
    phase = "fetch",
    label = "Download BSP package",
    gate = "fetch",
    after = ["core.init"],
    provides = ["fetch:bsp"]
)]
pub struct BspDownloadStage;

impl BspDownloadStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let v = cfg.release_version()?;
        let name = bsp_archive_name(v);
        let url = release_url(&cfg.profile.download.base_url, v, &name);
        download(
            ctx,
            &url,
            &downloads_path(cfg, &name),
            cfg.profile.download.bsp_sha256.as_deref(),
        )
    }
}

#[Stage(
    id = "fetch.rootfs",
    module = "fetch",
    phase = "fetch",
    label = "Download sample rootfs",
    gate = "fetch",
    after = ["core.init"],
    provides = ["fetch:rootfs"]
)]
pub struct RootfsDownloadStage;

impl RootfsDownloadStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let v = cfg.release_version()?;
        let name = rootfs_archive_name(v);
        let url = release_url(&cfg.profile.download.base_url, v, &name);
        download(
            ctx,
            &url,
            &downloads_path(cfg, &name),
            cfg.profile.download.rootfs_sha256.as_deref(),
        )
    }
}

#[Stage(
    id = "fetch.extract",
    module = "fetch",
    phase = "fetch",
    label = "Extract BSP and rootfs",
    gate = "fetch",
    after = ["fetch.bsp", "fetch.rootfs"],
    provides = ["fetch:extracted"]
)]
pub struct ExtractStage;

impl ExtractStage {
    pub fn run(cfg: &PipelineConfig, ctx: &mut ExecCtx) -> Result<()> {
        let v = cfg.release_version()?;
        let ws = &cfg.workspace;
        let bsp_archive = downloads_path(cfg, &bsp_archive_name(v));
        let rootfs_archive = downloads_path(cfg, &rootfs_archive_name(v));

        // The BSP tarball carries the Linux_for_Tegra prefix itself.
        util::extract_tarball(ctx, &bsp_archive, &ws.root, true)?;
        if !ws.rootfs_dir.is_dir() {
            return Err(Error::msg(format!(
                "BSP tree has no rootfs directory at {}",
                ws.rootfs_dir.display()
            )));
        }
        util::extract_tarball(ctx, &rootfs_archive, &ws.rootfs_dir, true)?;

        util::write_json_pretty(
            &ws.root.join("fetch-manifest.json"),
            &serde_json::json!({
                "release": v.to_string(),
                "fetched_at": chrono::Utc::now().to_rfc3339(),
                "artifacts": [
                    {
                        "name": bsp_archive_name(v),
                        "sha256": cfg.profile.download.bsp_sha256,
                    },
                    {
                        "name": rootfs_archive_name(v),
                        "sha256": cfg.profile.download.rootfs_sha256,
                    },
                ],
            }),
        )?;
        ctx.log("BSP tree extracted and rootfs populated");
        Ok(())
    }
}

#[Module(
    id = "fetch",
    gate = "fetch",
    tasks = [BspDownloadStage, RootfsDownloadStage, ExtractStage]
)]
pub struct FetchModule;

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32, patch: u32) -> ReleaseVersion {
        ReleaseVersion {
            major,
            minor,
            patch,
        }
    }

    #[test]
    fn artifact_names_embed_the_release() {
        assert_eq!(
            bsp_archive_name(v(36, 4, 4)),
            "Jetson_Linux_R36.4.4_aarch64.tbz2"
        );
        assert_eq!(
            rootfs_archive_name(v(36, 4, 4)),
            "Tegra_Linux_Sample-Root-Filesystem_R36.4.4_aarch64.tbz2"
        );
    }

    #[test]
    fn release_url_splits_the_version_between_dir_and_file() {
        let url = release_url("https://mirror.example/l4t/", v(36, 4, 4), "file.tbz2");
        assert_eq!(
            url,
            "https://mirror.example/l4t/r36_release_v4.4/release/file.tbz2"
        );
    }

    #[test]
    fn sha256_file_hex_matches_known_vector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = dir.path().join("f");
        fs::write(&p, b"abc").expect("write");
        assert_eq!(
            sha256_file_hex(&p).expect("digest"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
