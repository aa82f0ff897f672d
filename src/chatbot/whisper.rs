//! Speech-to-text transcription using whisper-rs.
//!
//! Converts voice messages (OGG Opus from Telegram) to text and reports how
//! long the audio was, so it can be billed as transcribed seconds.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Sample rate Whisper expects.
const SAMPLE_RATE: usize = 16_000;

/// Result of one transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub seconds: f64,
}

/// Whisper transcription engine.
#[derive(Clone)]
pub struct Whisper {
    ctx: Arc<WhisperContext>,
}

impl Whisper {
    /// Load a Whisper model from a .bin file.
    pub fn new(model_path: &Path) -> Result<Self, String> {
        info!("Loading Whisper model from {:?}", model_path);

        if !model_path.exists() {
            return Err(format!("Model file not found: {:?}", model_path));
        }

        let ctx = WhisperContext::new_with_params(
            model_path.to_str().ok_or("Invalid model path")?,
            WhisperContextParameters::default(),
        )
        .map_err(|e| format!("Failed to load Whisper model: {e}"))?;

        info!("Whisper model loaded");
        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Transcribe OGG Opus audio. Blocking; call from a blocking thread.
    pub fn transcribe(&self, ogg_data: &[u8]) -> Result<Transcription, String> {
        debug!("Transcribing {} bytes of audio", ogg_data.len());

        let samples = convert_ogg_to_pcm(ogg_data)?;
        let seconds = audio_seconds(samples.len());

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| format!("Failed to create Whisper state: {e}"))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some("auto"));
        params.set_translate(false);
        params.set_no_timestamps(true);
        params.set_single_segment(false);

        state
            .full(params, &samples)
            .map_err(|e| format!("Whisper transcription failed: {e}"))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            if let Ok(s) = segment.to_str() {
                text.push_str(s);
                text.push(' ');
            }
        }

        let text = text.trim().to_string();
        info!("Transcribed {:.1}s: \"{}\"", seconds, truncate(&text, 100));
        Ok(Transcription { text, seconds })
    }
}

fn audio_seconds(samples: usize) -> f64 {
    samples as f64 / SAMPLE_RATE as f64
}

/// Convert OGG Opus audio to 16KHz mono f32 PCM samples using ffmpeg.
fn convert_ogg_to_pcm(ogg_data: &[u8]) -> Result<Vec<f32>, String> {
    // ffmpeg needs seekable input for OGG
    let input_path = std::env::temp_dir().join(format!("voice_{}.ogg", uuid::Uuid::new_v4()));
    std::fs::write(&input_path, ogg_data).map_err(|e| format!("Failed to write temp input: {e}"))?;

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(&input_path)
        .args([
            "-ar", "16000", "-ac", "1", "-f", "s16le", "-acodec", "pcm_s16le", "-y", "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let _ = std::fs::remove_file(&input_path);
    let output = output.map_err(|e| format!("Failed to run ffmpeg: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ffmpeg failed: {}", stderr));
    }

    Ok(pcm_s16le_to_f32(&output.stdout))
}

fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 5), "hello...");
        assert_eq!(truncate("привет", 3), "при...");
    }

    #[test]
    fn test_audio_seconds() {
        assert_eq!(audio_seconds(0), 0.0);
        assert_eq!(audio_seconds(16_000), 1.0);
        assert_eq!(audio_seconds(24_000), 1.5);
    }

    #[test]
    fn test_pcm_conversion() {
        let bytes = [0x00, 0x00, 0x00, 0x40, 0x00, 0x80, 0xff];
        let samples = pcm_s16le_to_f32(&bytes);
        assert_eq!(samples, vec![0.0, 0.5, -1.0]);
    }
}
