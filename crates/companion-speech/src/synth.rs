//! Speech synthesis backend. The pipeline talks to the [`SpeechSynth`] trait;
//! the shipped implementation posts to an HTTP endpoint and decodes whatever
//! audio container comes back.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::{BackendConfig, SynthSettings};
use crate::error::{Result, SpeechError};
use crate::output::AudioClip;
use crate::sink::UiSink;

/// A synthesis backend. Returns `Ok(None)` for text that produces no audio,
/// which the player treats as an instantly finished chunk.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Option<AudioClip>>;
}

#[derive(serde::Serialize)]
struct SynthRequest<'a> {
    text: &'a str,
    voice: &'a str,
    #[serde(flatten)]
    settings: &'a SynthSettings,
}

/// HTTP client for the synthesis endpoint. One request per chunk; the
/// response body is the encoded audio.
pub struct HttpSynth {
    client: reqwest::Client,
    config: BackendConfig,
    ui: Arc<dyn UiSink>,
}

impl HttpSynth {
    pub fn new(config: BackendConfig, ui: Arc<dyn UiSink>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            ui,
        }
    }

    async fn request(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        let body = SynthRequest {
            text,
            voice: voice_id,
            settings: &self.config.settings,
        };
        let response = self
            .client
            .post(&self.config.api_url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SpeechError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if message.to_lowercase().contains("too long") {
                return Err(SpeechError::TooLong);
            }
            return Err(SpeechError::Backend {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SpeechSynth for HttpSynth {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Option<AudioClip>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        tracing::debug!(voice_id, chars = text.chars().count(), "synthesis request");
        self.ui.set_loading(true);
        let outcome = self.request(text, voice_id).await;
        self.ui.set_loading(false);
        let bytes = outcome?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let format_hint = self.config.settings.output_format.clone();
        let clip = tokio::task::spawn_blocking(move || decode_audio(&bytes, &format_hint))
            .await
            .map_err(|e| SpeechError::Decode(e.to_string()))??;
        if clip.is_empty() {
            return Ok(None);
        }
        Ok(Some(clip))
    }
}

/// Decode an encoded audio payload into mono f32 samples. Multi-channel
/// sources are averaged down; the container is sniffed from the bytes with
/// the configured output format as a hint.
pub fn decode_audio(bytes: &[u8], format_hint: &str) -> Result<AudioClip> {
    let source = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());
    let mut hint = Hint::new();
    if !format_hint.is_empty() {
        hint.with_extension(format_hint);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| SpeechError::Decode(format!("unrecognized container: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| SpeechError::Decode("no decodable track".to_string()))?;
    let track_id = track.id;
    let sample_rate_hz = track
        .codec_params
        .sample_rate
        .ok_or_else(|| SpeechError::Decode("missing sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| SpeechError::Decode(format!("codec setup failed: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(symphonia::core::errors::Error::ResetRequired) => break,
            Err(e) => return Err(SpeechError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt packet mid-stream is recoverable; skip it.
            Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
            Err(e) => return Err(SpeechError::Decode(e.to_string())),
        };
        append_mono(&decoded, &mut samples);
    }

    Ok(AudioClip {
        samples,
        sample_rate_hz,
    })
}

fn append_mono(decoded: &AudioBufferRef<'_>, out: &mut Vec<f32>) {
    let mut buf = decoded.make_equivalent::<f32>();
    decoded.convert(&mut buf);
    let channels = buf.spec().channels.count();
    let frames = buf.frames();
    if channels == 0 || frames == 0 {
        return;
    }
    out.reserve(frames);
    if channels == 1 {
        out.extend_from_slice(buf.chan(0));
        return;
    }
    let scale = 1.0 / channels as f32;
    for frame in 0..frames {
        let mut acc = 0.0f32;
        for ch in 0..channels {
            acc += buf.chan(ch)[frame];
        }
        out.push(acc * scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullUi;

    fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn request_body_flattens_settings() {
        let settings = SynthSettings::default();
        let body = SynthRequest {
            text: "hi",
            voice: "en_us_001",
            settings: &settings,
        };
        let value = serde_json::to_value(&body).expect("body serializes");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["voice"], "en_us_001");
        assert_eq!(value["seed"], 3000);
        assert_eq!(value["output_format"], "wav");
    }

    #[test]
    fn decodes_pcm_wav_to_mono_f32() {
        let samples: Vec<i16> = (0..480).map(|i| (i * 64) as i16).collect();
        let bytes = wav_bytes(&samples, 24_000);
        let clip = decode_audio(&bytes, "wav").expect("wav should decode");
        assert_eq!(clip.sample_rate_hz, 24_000);
        assert_eq!(clip.samples.len(), 480);
        assert_eq!(clip.duration_ms(), 20);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = decode_audio(&[0u8; 64], "wav").unwrap_err();
        assert!(matches!(err, SpeechError::Decode(_)));
    }

    #[tokio::test]
    async fn empty_text_skips_the_backend() {
        // An unroutable URL: if the client tried to connect the test would
        // error, so Ok(None) proves no request was made.
        let config = BackendConfig {
            api_url: "http://127.0.0.1:1/tts".to_string(),
            ..BackendConfig::default()
        };
        let synth = HttpSynth::new(config, Arc::new(NullUi));
        let clip = synth.synthesize("   ", "en_us_001").await.expect("no call");
        assert!(clip.is_none());
    }
}
