use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use stagecast_core::config::TranscodeConfig;

/// Files one bridge session leaves in the output directory
#[derive(Debug, Clone)]
pub struct HlsArtifacts {
    dir: PathBuf,
    sdp_path: PathBuf,
    manifest_path: PathBuf,
    /// ffmpeg writes the manifest here first, then renames it
    manifest_tmp_path: PathBuf,
    /// Segment files are `<stem><n>.ts`
    segment_stem: String,
}

impl HlsArtifacts {
    #[must_use]
    pub fn new(config: &TranscodeConfig) -> Self {
        let dir = PathBuf::from(&config.output_dir);
        let segment_stem = Path::new(&config.manifest_file)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let manifest_path = dir.join(&config.manifest_file);
        let mut manifest_tmp = manifest_path.clone().into_os_string();
        manifest_tmp.push(".tmp");

        Self {
            sdp_path: dir.join(&config.sdp_file),
            manifest_path,
            manifest_tmp_path: PathBuf::from(manifest_tmp),
            dir,
            segment_stem,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn sdp_path(&self) -> &Path {
        &self.sdp_path
    }

    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    pub async fn write_sdp(&self, sdp: &str) -> std::io::Result<()> {
        tokio::fs::write(&self.sdp_path, sdp).await?;
        debug!(path = %self.sdp_path.display(), "SDP written");
        Ok(())
    }

    fn is_segment(&self, name: &str) -> bool {
        name.strip_suffix(".ts")
            .and_then(|rest| rest.strip_prefix(self.segment_stem.as_str()))
            .is_some_and(|index| index.chars().all(|c| c.is_ascii_digit()))
    }

    /// Delete the SDP file, the manifest (and its temporary copy) and every
    /// segment; returns files removed
    pub async fn cleanup(&self) -> usize {
        let mut removed = 0;
        for path in [&self.sdp_path, &self.manifest_path, &self.manifest_tmp_path] {
            if remove_file(path).await {
                removed += 1;
            }
        }

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return removed,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list output directory");
                return removed;
            }
        };

        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    if self.is_segment(&name.to_string_lossy()) && remove_file(&entry.path()).await
                    {
                        removed += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Failed to read output directory");
                    break;
                }
            }
        }

        debug!(dir = %self.dir.display(), removed, "HLS artifacts removed");
        removed
    }
}

async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove artifact");
            false
        }
    }
}
