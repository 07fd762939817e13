use std::path::Path;

/// Container formats accepted at ingest.
pub const ALLOWED_VIDEO_TYPES: &[&str] = &[
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "video/x-msvideo",
    "video/x-matroska",
    "video/webm",
    "video/x-flv",
    "video/3gpp",
    "video/x-ms-wmv",
];

pub const HLS_PLAYLIST: &str = "application/x-mpegURL";
pub const TRANSPORT_STREAM: &str = "video/MP2T";
pub const OCTET_STREAM: &str = "application/octet-stream";

pub fn is_allowed_video_type(mime_type: &str) -> bool {
    ALLOWED_VIDEO_TYPES.contains(&mime_type)
}

/// Extension (with dot) used for a locally stored source of `mime_type`.
pub fn file_extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "video/mp4" | "video/x-mp4" => ".mp4",
        "video/mpeg" => ".mpeg",
        "video/quicktime" => ".mov",
        "video/x-msvideo" => ".avi",
        "video/x-matroska" => ".mkv",
        "video/webm" => ".webm",
        "video/x-flv" => ".flv",
        "video/3gpp" => ".3gp",
        "video/x-ms-wmv" => ".wmv",
        "video/ogg" => ".ogv",
        "application/x-mpegURL" | "application/vnd.apple.mpegurl" => ".m3u8",
        "application/dash+xml" => ".mpd",
        "video/mp2t" => ".ts",
        _ => ".bin",
    }
}

/// Content type for an uploaded output file, chosen by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("m3u8") => HLS_PLAYLIST,
        Some("ts") => TRANSPORT_STREAM,
        Some("mp4") => "video/mp4",
        Some("mpd") => "application/dash+xml",
        Some("vtt") => "text/vtt",
        Some("srt") => "application/x-subrip",
        _ => OCTET_STREAM,
    }
}
