//! The fixed HLS ladder, encoder arguments per rendition, and the master
//! playlist that ties the renditions together.

use std::fmt::Write;
use std::path::Path;

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const SEGMENT_SECONDS: u32 = 10;
const AUDIO_SAMPLE_RATE: &str = "48000";
const AUDIO_BITRATE: &str = "128k";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionSpec {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

pub const RENDITION_LADDER: [RenditionSpec; 4] = [
    RenditionSpec { width: 1920, height: 1080, bitrate_kbps: 5000 },
    RenditionSpec { width: 1280, height: 720, bitrate_kbps: 3000 },
    RenditionSpec { width: 854, height: 480, bitrate_kbps: 1500 },
    RenditionSpec { width: 640, height: 360, bitrate_kbps: 800 },
];

impl RenditionSpec {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// 1.1 x bitrate, rounded.
    pub fn max_rate_kbps(&self) -> u32 {
        (self.bitrate_kbps * 11 + 5) / 10
    }

    /// 1.5 x bitrate, rounded.
    pub fn buffer_size_kbps(&self) -> u32 {
        (self.bitrate_kbps * 15 + 5) / 10
    }

    /// Bits per second, as advertised in the master playlist.
    pub fn bandwidth(&self) -> u64 {
        u64::from(self.bitrate_kbps) * 1000
    }

    pub fn playlist_file_name(&self) -> String {
        format!("index_{}.m3u8", self.resolution())
    }

    pub fn segment_pattern(&self) -> String {
        format!("segment_{}_%03d.ts", self.resolution())
    }

    /// ffmpeg arguments that scale, re-encode and segment `input` into
    /// `output_dir`.
    pub fn ffmpeg_args(&self, input: &Path, output_dir: &Path) -> Vec<String> {
        let segments = output_dir.join(self.segment_pattern());
        let playlist = output_dir.join(self.playlist_file_name());

        [
            "-y",
            "-nostdin",
            "-i",
            &input.to_string_lossy(),
            "-vf",
            &format!("scale={}:{},format=yuv420p", self.width, self.height),
            "-c:v",
            "libx264",
            "-b:v",
            &format!("{}k", self.bitrate_kbps),
            "-maxrate",
            &format!("{}k", self.max_rate_kbps()),
            "-bufsize",
            &format!("{}k", self.buffer_size_kbps()),
            "-preset",
            "fast",
            "-profile:v",
            "main",
            "-c:a",
            "aac",
            "-ar",
            AUDIO_SAMPLE_RATE,
            "-b:a",
            AUDIO_BITRATE,
            "-hls_time",
            &SEGMENT_SECONDS.to_string(),
            "-hls_list_size",
            "0",
            "-hls_playlist_type",
            "vod",
            "-hls_segment_filename",
            &segments.to_string_lossy(),
            &playlist.to_string_lossy(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// A finished rendition. Storage location is filled in after upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionOutput {
    pub resolution: String,
    pub bandwidth: u64,
    pub file_name: String,
    pub url: Option<String>,
    pub key: Option<String>,
}

impl From<&RenditionSpec> for RenditionOutput {
    fn from(spec: &RenditionSpec) -> Self {
        Self {
            resolution: spec.resolution(),
            bandwidth: spec.bandwidth(),
            file_name: spec.playlist_file_name(),
            url: None,
            key: None,
        }
    }
}

pub fn master_playlist(renditions: &[RenditionOutput]) -> String {
    let mut content = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rendition in renditions {
        let _ = writeln!(
            content,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}",
            rendition.bandwidth, rendition.resolution
        );
        let _ = writeln!(content, "{}", rendition.file_name);
    }
    content
}
