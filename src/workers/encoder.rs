use super::error::JobError;
use crate::modules::transcoding::rendition::RenditionSpec;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

const STDERR_TAIL_LINES: usize = 5;

/// Produces one HLS rendition (playlist plus segments) in `output_dir`.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, spec: &RenditionSpec, input: &Path, output_dir: &Path) -> Result<(), JobError>;
}

pub struct FfmpegEncoder {
    binary: String,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, spec: &RenditionSpec, input: &Path, output_dir: &Path) -> Result<(), JobError> {
        let resolution = spec.resolution();
        let args = spec.ffmpeg_args(input, output_dir);
        debug!("{} {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| JobError::Encode {
                resolution: resolution.clone(),
                message: format!("failed to start {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            return Err(JobError::Encode {
                message: format!(
                    "{} ({})",
                    output.status,
                    stderr_tail(&String::from_utf8_lossy(&output.stderr))
                ),
                resolution,
            });
        }

        info!("🎞️ Rendition {} encoded", resolution);
        Ok(())
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::transcoding::rendition::RENDITION_LADDER;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr = "a\nb\n\nc\nd\ne\nf\n";
        assert_eq!(stderr_tail(stderr), "b | c | d | e | f");
        assert_eq!(stderr_tail(""), "");
    }

    #[tokio::test]
    async fn missing_binary_is_an_encode_error() {
        let encoder = FfmpegEncoder::new("definitely-not-an-encoder-binary");
        let dir = tempfile::tempdir().unwrap();

        let err = encoder
            .encode(&RENDITION_LADDER[3], &dir.path().join("in.mp4"), dir.path())
            .await
            .unwrap_err();

        match err {
            JobError::Encode { resolution, message } => {
                assert_eq!(resolution, "640x360");
                assert!(message.contains("failed to start"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
