use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::GatewayError;

pub const WAVEFORM_BUCKETS: usize = 56;
// Waveform extraction is bounded CPU work: at most ~5 minutes of 16 kHz audio.
const MAX_WAVEFORM_SAMPLES: usize = 5 * 60 * 16000;

/// Object storage for media artifacts. The hosted bucket is an external
/// collaborator; this trait is its interface. `upload` returns the public URL
/// on success and `None` when the tier is unavailable (callers fall back to
/// the locally served `/media/...` URL).
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, local_path: &str, content_type: Option<&str>) -> Option<String>;
}

/// Default storage: artifacts stay in the media directory and are served by
/// the gateway itself under `/media/{filename}`.
pub struct LocalMediaStorage {
    base_url: String,
    media_dir: PathBuf,
}

impl LocalMediaStorage {
    pub fn new(base_url: &str, media_dir: &Path) -> Self {
        LocalMediaStorage {
            base_url: base_url.trim_end_matches('/').to_string(),
            media_dir: media_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalMediaStorage {
    async fn upload(&self, local_path: &str, _content_type: Option<&str>) -> Option<String> {
        let src = Path::new(local_path);
        let name = src.file_name()?.to_string_lossy().to_string();
        let dest = self.media_dir.join(&name);
        if src != dest {
            if let Err(e) = tokio::fs::copy(src, &dest).await {
                warn!("Media copy to {} failed: {e}", dest.display());
                return None;
            }
        }
        Some(format!("{}/media/{name}", self.base_url))
    }
}

/// Stable media filename derived from kind, timestamp and a short random
/// suffix, e.g. `image_20240101_120000_1a2b3c4d.jpg`.
pub fn media_filename(kind: &str, extension: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let ext = if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    };
    format!("{kind}_{stamp}_{}{ext}", &suffix[..8])
}

/// File extension for a MIME type. Common media types are pinned so the
/// resolver never picks an unusual alias; inbound audio defaults to `.ogg`.
pub fn extension_for_mime(mime_type: &str) -> String {
    let essence = mime_type.split(';').next().unwrap_or("").trim();
    match essence {
        "image/jpeg" => ".jpg".into(),
        "image/png" => ".png".into(),
        "image/webp" => ".webp".into(),
        "image/gif" => ".gif".into(),
        "audio/ogg" => ".ogg".into(),
        "audio/mpeg" => ".mp3".into(),
        "audio/mp4" => ".m4a".into(),
        "video/mp4" => ".mp4".into(),
        "video/3gpp" => ".3gp".into(),
        "application/pdf" => ".pdf".into(),
        _ => {
            if let Some(ext) = mime_guess::get_mime_extensions_str(essence)
                .and_then(|exts| exts.first())
            {
                format!(".{ext}")
            } else if essence.starts_with("audio/") {
                ".ogg".into()
            } else {
                String::new()
            }
        }
    }
}

/// Transcode any audio container to the voice profile the upstream accepts:
/// mono, 16 kHz, Opus at 48 kbit/s, VoIP application. Returns the new path
/// with an `.ogg` extension.
pub async fn convert_to_ogg_opus(src_path: &Path) -> Result<PathBuf, GatewayError> {
    let dst_path = src_path.with_extension("ogg");
    let output = Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(src_path)
        .args([
            "-ac", "1", "-ar", "16000", "-c:a", "libopus", "-b:a", "48k", "-application", "voip",
        ])
        .arg(&dst_path)
        .output()
        .await
        .map_err(|e| GatewayError::Media(format!("ffmpeg spawn failed: {e}")))?;
    if !output.status.success() {
        return Err(GatewayError::Media(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(dst_path)
}

/// Peak-based waveform for audio bubbles: decode to mono s16le PCM at 16 kHz
/// and record the normalized peak per bucket (0..100). Decode failures yield
/// a flat placeholder so the UI still renders a bubble.
pub async fn compute_audio_waveform(src_path: &Path, buckets: usize) -> Vec<u8> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-i"])
        .arg(src_path)
        .args(["-ac", "1", "-ar", "16000", "-f", "s16le", "pipe:1"])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() && !out.stdout.is_empty() => {
            waveform_from_pcm(&out.stdout, buckets)
        }
        Ok(out) => {
            debug!("waveform decode failed: {}", String::from_utf8_lossy(&out.stderr));
            vec![30; buckets.max(1)]
        }
        Err(e) => {
            debug!("waveform ffmpeg spawn failed: {e}");
            vec![30; buckets.max(1)]
        }
    }
}

pub fn waveform_from_pcm(pcm: &[u8], buckets: usize) -> Vec<u8> {
    let num_buckets = buckets.clamp(8, 256);
    let mut num_samples = pcm.len() / 2;
    if num_samples == 0 {
        return vec![30; num_buckets];
    }
    if num_samples > MAX_WAVEFORM_SAMPLES {
        num_samples = MAX_WAVEFORM_SAMPLES;
    }

    let bucket_size = (num_samples / num_buckets).max(1);
    let mut peaks: Vec<i32> = Vec::with_capacity(num_buckets);
    let mut max_abs: i32 = 1;
    let mut index = 0;
    while index < num_samples && peaks.len() < num_buckets {
        let end = (index + bucket_size).min(num_samples);
        let mut local_peak: i32 = 0;
        for sample_idx in index..end {
            let lo = pcm[sample_idx * 2];
            let hi = pcm[sample_idx * 2 + 1];
            let sample = i16::from_le_bytes([lo, hi]) as i32;
            local_peak = local_peak.max(sample.abs());
        }
        peaks.push(local_peak);
        max_abs = max_abs.max(local_peak);
        index = end;
    }

    let mut normalized: Vec<u8> = peaks
        .iter()
        .map(|p| (((*p as f64 / max_abs as f64) * 100.0).round() as i64).clamp(0, 100) as u8)
        .collect();
    normalized.resize(num_buckets, 0);
    normalized
}
