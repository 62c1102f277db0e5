use std::collections::HashMap;

use anyhow::Context;

/// Tunables for the playback pipeline. The defaults mirror the values the
/// companion client has always shipped with; everything here can be overridden
/// from the config file.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Maximum chunk size in characters when grouping sentences.
    pub chunk_char_limit: usize,
    /// Minimum per-chunk playback timeout.
    pub timeout_floor_ms: u64,
    /// Extra time granted on top of the clip duration before a chunk is
    /// declared stuck.
    pub timeout_margin_ms: u64,
    /// How often a chunk may be bisected after a "too long" rejection before
    /// it is abandoned.
    pub max_split_attempts: u32,
    /// Pause between consecutive chunks for natural cadence.
    pub inter_chunk_pause_ms: u64,
    /// Animation tick period for mouth updates.
    pub tick_interval_ms: u64,
    /// Exponential smoothing factor applied to the mouth level.
    pub mouth_smoothing: f32,
    /// Band energy below this level is treated as silence.
    pub mouth_noise_floor: f32,
    /// Gain applied to the smoothed level before clamping to [0, 1].
    pub mouth_gain: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            chunk_char_limit: 300,
            timeout_floor_ms: 8_000,
            timeout_margin_ms: 4_000,
            max_split_attempts: 5,
            inter_chunk_pause_ms: 150,
            tick_interval_ms: 33,
            mouth_smoothing: 0.8,
            mouth_noise_floor: 0.02,
            mouth_gain: 4.0,
        }
    }
}

/// Synthesis parameters forwarded verbatim to the backend with every request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SynthSettings {
    pub temperature: f64,
    pub exaggeration: f64,
    pub cfg_weight: f64,
    pub speed_factor: f64,
    pub seed: u64,
    pub output_format: String,
}

impl Default for SynthSettings {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            exaggeration: 1.3,
            cfg_weight: 0.5,
            speed_factor: 1.0,
            seed: 3000,
            output_format: "wav".to_string(),
        }
    }
}

/// Speech-synthesis backend endpoint plus the voice lookup table.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BackendConfig {
    pub api_url: String,
    /// Default voice per language code, e.g. "en-US" -> "en_us_001".
    #[serde(default)]
    pub voices: HashMap<String, String>,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default)]
    pub settings: SynthSettings,
}

fn default_voice() -> String {
    "en_us_001".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8004/tts".to_string(),
            voices: HashMap::new(),
            default_voice: default_voice(),
            settings: SynthSettings::default(),
        }
    }
}

/// The whole config file: backend fields at the top level, pipeline
/// tunables under `[speech]`. Everything except `api_url` has a default.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
}

impl Config {
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}

impl BackendConfig {
    /// Resolve the voice for a language code. An explicit override wins, then
    /// the exact code, then the primary subtag ("pt" for "pt-BR"), then the
    /// configured default.
    pub fn voice_for(&self, language_code: &str, selected: Option<&str>) -> String {
        if let Some(voice) = selected {
            if !voice.is_empty() {
                return voice.to_string();
            }
        }
        if let Some(voice) = self.voices.get(language_code) {
            return voice.clone();
        }
        let primary = language_code.split('-').next().unwrap_or(language_code);
        if let Some(voice) = self.voices.get(primary) {
            return voice.clone();
        }
        self.default_voice.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_resolution_prefers_override_then_exact_then_primary() {
        let mut voices = HashMap::new();
        voices.insert("en-US".to_string(), "en_us_001".to_string());
        voices.insert("pt".to_string(), "pt_generic".to_string());
        let config = BackendConfig {
            voices,
            default_voice: "fallback".to_string(),
            ..BackendConfig::default()
        };

        assert_eq!(config.voice_for("en-US", Some("custom")), "custom");
        assert_eq!(config.voice_for("en-US", None), "en_us_001");
        assert_eq!(config.voice_for("pt-BR", None), "pt_generic");
        assert_eq!(config.voice_for("ja-JP", None), "fallback");
    }

    #[test]
    fn backend_config_parses_minimal_toml() {
        let config: BackendConfig = toml::from_str(r#"api_url = "http://example/tts""#)
            .expect("minimal config should parse");
        assert_eq!(config.api_url, "http://example/tts");
        assert_eq!(config.default_voice, "en_us_001");
        assert_eq!(config.settings.seed, 3000);
    }

    #[test]
    fn speech_section_overrides_pipeline_tunables() {
        let config: Config = toml::from_str(
            r#"
            api_url = "http://example/tts"

            [voices]
            "en-US" = "en_us_001"

            [speech]
            chunk_char_limit = 120
            timeout_floor_ms = 5000
            "#,
        )
        .expect("config with [speech] should parse");
        assert_eq!(config.backend.api_url, "http://example/tts");
        assert_eq!(config.speech.chunk_char_limit, 120);
        assert_eq!(config.speech.timeout_floor_ms, 5_000);
        // Untouched tunables keep their defaults.
        assert_eq!(config.speech.max_split_attempts, 5);
    }
}
