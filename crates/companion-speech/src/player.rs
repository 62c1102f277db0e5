//! Plays a single chunk end to end: fetch (or accept prefetched) audio, run
//! it through the output with a stuck-playback timeout, and drive the avatar
//! mouth from the output's band level while it plays.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::config::SpeechConfig;
use crate::error::{Result, SpeechError};
use crate::output::{AudioClip, AudioOutput, MouthLevel};
use crate::sink::{AvatarSink, PARAM_MOUTH_FORM, PARAM_MOUTH_OPEN};
use crate::synth::SpeechSynth;

/// Mouth-form value while the avatar is at rest between chunks.
const MOUTH_FORM_RESTING: f32 = 1.0;
/// Scale between mouth openness and mouth form while speaking.
const MOUTH_FORM_SCALE: f32 = 0.4;

pub struct ChunkPlayer {
    synth: Arc<dyn SpeechSynth>,
    output: Arc<dyn AudioOutput>,
    avatar: Option<Arc<dyn AvatarSink>>,
    config: SpeechConfig,
}

impl ChunkPlayer {
    pub fn new(
        synth: Arc<dyn SpeechSynth>,
        output: Arc<dyn AudioOutput>,
        avatar: Option<Arc<dyn AvatarSink>>,
        config: SpeechConfig,
    ) -> Self {
        Self {
            synth,
            output,
            avatar,
            config,
        }
    }

    /// Play one chunk of text. `prefetched` is used as-is when present;
    /// otherwise the text is synthesized first. A backend "too long"
    /// rejection bisects the text at whitespace and plays both halves, up to
    /// the configured split ceiling.
    pub async fn play_chunk(
        &self,
        text: &str,
        voice_id: &str,
        prefetched: Option<AudioClip>,
    ) -> Result<()> {
        if let Some(clip) = prefetched {
            return self.play_clip(&clip).await;
        }
        self.play_text(text, voice_id, 0).await
    }

    fn play_text<'a>(
        &'a self,
        text: &'a str,
        voice_id: &'a str,
        attempt: u32,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self.synth.synthesize(text, voice_id).await {
                Ok(Some(clip)) => self.play_clip(&clip).await,
                Ok(None) => Ok(()),
                Err(err) if err.is_too_long() && attempt < self.config.max_split_attempts => {
                    let (head, tail) = match split_for_retry(text) {
                        Some(parts) => parts,
                        // Too short to halve; give up on this chunk.
                        None => return Err(err),
                    };
                    tracing::info!(
                        attempt = attempt + 1,
                        head_chars = head.chars().count(),
                        tail_chars = tail.chars().count(),
                        "text rejected as too long, splitting"
                    );
                    self.play_text(head, voice_id, attempt + 1).await?;
                    self.play_text(tail, voice_id, attempt + 1).await
                }
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    /// Run one clip through the output, animating the mouth until the output
    /// goes quiet or the timeout fires. The timeout generously covers the
    /// clip's own duration so it only trips on genuinely stuck playback.
    async fn play_clip(&self, clip: &AudioClip) -> Result<()> {
        if clip.is_empty() {
            return Ok(());
        }

        self.output.begin(clip)?;

        let timeout_ms = self
            .config
            .timeout_floor_ms
            .max(clip.duration_ms() + self.config.timeout_margin_ms);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let mut mouth = MouthLevel::new(
            self.config.mouth_smoothing,
            self.config.mouth_noise_floor,
            self.config.mouth_gain,
        );
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            if !self.output.is_active() {
                self.rest_mouth();
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(timeout_ms, "playback timed out, stopping output");
                self.output.stop();
                self.rest_mouth();
                return Err(SpeechError::Timeout(timeout_ms));
            }

            if let Some(avatar) = self.avatar.as_ref() {
                let level = mouth.update(self.output.band_level());
                avatar.set_parameter(PARAM_MOUTH_OPEN, level);
                avatar.set_parameter(PARAM_MOUTH_FORM, level * MOUTH_FORM_SCALE);
            }
        }
    }

    fn rest_mouth(&self) {
        if let Some(avatar) = self.avatar.as_ref() {
            avatar.set_parameter(PARAM_MOUTH_OPEN, 0.0);
            avatar.set_parameter(PARAM_MOUTH_FORM, MOUTH_FORM_RESTING);
        }
    }
}

/// Split text for a retry: at the whitespace nearest its midpoint, or at the
/// char boundary nearest the midpoint when there is no usable whitespace
/// (CJK text rarely has any). Returns `None` only for text too short to
/// halve.
fn split_for_retry(text: &str) -> Option<(&str, &str)> {
    let mid = text.len() / 2;

    let whitespace = text
        .char_indices()
        .filter(|(_, c)| c.is_whitespace())
        .min_by_key(|(i, _)| i.abs_diff(mid))
        .map(|(i, _)| i);
    if let Some(split_at) = whitespace {
        let head = text[..split_at].trim();
        let tail = text[split_at..].trim();
        if !head.is_empty() && !tail.is_empty() {
            return Some((head, tail));
        }
    }

    let split_at = midpoint_boundary(text)?;
    let head = text[..split_at].trim();
    let tail = text[split_at..].trim();
    (!head.is_empty() && !tail.is_empty()).then_some((head, tail))
}

/// Char boundary nearest `text.len() / 2`, excluding the ends.
fn midpoint_boundary(text: &str) -> Option<usize> {
    let mid = text.len() / 2;
    let mut down = mid;
    while down > 0 && !text.is_char_boundary(down) {
        down -= 1;
    }
    if down > 0 {
        return Some(down);
    }
    let mut up = mid.max(1);
    while up < text.len() && !text.is_char_boundary(up) {
        up += 1;
    }
    (up < text.len()).then_some(up)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::NullOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_config() -> SpeechConfig {
        SpeechConfig {
            timeout_floor_ms: 50,
            timeout_margin_ms: 10,
            tick_interval_ms: 5,
            ..SpeechConfig::default()
        }
    }

    fn clip(samples: usize) -> AudioClip {
        AudioClip {
            samples: vec![0.5; samples],
            sample_rate_hz: 1_000,
        }
    }

    struct InstantSynth;

    #[async_trait]
    impl SpeechSynth for InstantSynth {
        async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Option<AudioClip>> {
            Ok(Some(clip(text.len())))
        }
    }

    /// Rejects text longer than `limit` the way the backend does.
    struct PickySynth {
        limit: usize,
        accepted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SpeechSynth for PickySynth {
        async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Option<AudioClip>> {
            if text.chars().count() > self.limit {
                return Err(SpeechError::TooLong);
            }
            match self.accepted.lock() {
                Ok(mut guard) => guard.push(text.to_string()),
                Err(poisoned) => poisoned.into_inner().push(text.to_string()),
            }
            Ok(Some(clip(text.len())))
        }
    }

    /// Output that claims to be playing forever, to exercise the timeout.
    struct StuckOutput {
        stops: AtomicUsize,
    }

    impl AudioOutput for StuckOutput {
        fn begin(&self, _clip: &AudioClip) -> Result<()> {
            Ok(())
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn is_active(&self) -> bool {
            true
        }
        fn band_level(&self) -> f32 {
            0.0
        }
    }

    #[derive(Default)]
    struct RecordingAvatar {
        params: Mutex<Vec<(String, f32)>>,
    }

    impl AvatarSink for RecordingAvatar {
        fn set_parameter(&self, name: &str, value: f32) {
            if let Ok(mut guard) = self.params.lock() {
                guard.push((name.to_string(), value));
            }
        }
    }

    #[tokio::test]
    async fn plays_a_chunk_to_completion() {
        let player = ChunkPlayer::new(
            Arc::new(InstantSynth),
            Arc::new(NullOutput),
            None,
            fast_config(),
        );
        player
            .play_chunk("hello world", "voice", None)
            .await
            .expect("chunk should play");
    }

    #[tokio::test]
    async fn prefetched_clip_skips_synthesis() {
        struct FailingSynth;

        #[async_trait]
        impl SpeechSynth for FailingSynth {
            async fn synthesize(&self, _: &str, _: &str) -> Result<Option<AudioClip>> {
                panic!("synthesize must not be called when a clip was prefetched");
            }
        }

        let player = ChunkPlayer::new(
            Arc::new(FailingSynth),
            Arc::new(NullOutput),
            None,
            fast_config(),
        );
        player
            .play_chunk("ignored", "voice", Some(clip(10)))
            .await
            .expect("prefetched clip should play");
    }

    #[tokio::test]
    async fn too_long_rejection_splits_until_accepted() {
        let synth = Arc::new(PickySynth {
            limit: 12,
            accepted: Mutex::new(Vec::new()),
        });
        let player = ChunkPlayer::new(
            synth.clone(),
            Arc::new(NullOutput),
            None,
            fast_config(),
        );

        player
            .play_chunk("alpha beta gamma delta epsilon zeta", "voice", None)
            .await
            .expect("split retries should succeed");

        let accepted = synth.accepted.lock().unwrap();
        assert!(accepted.len() >= 3);
        assert!(accepted.iter().all(|t| t.chars().count() <= 12));
        assert_eq!(
            accepted.join(" "),
            "alpha beta gamma delta epsilon zeta"
        );
    }

    #[tokio::test]
    async fn whitespace_free_text_bisects_at_the_midpoint() {
        let synth = Arc::new(PickySynth {
            limit: 10,
            accepted: Mutex::new(Vec::new()),
        });
        let player = ChunkPlayer::new(
            synth.clone(),
            Arc::new(NullOutput),
            None,
            fast_config(),
        );

        player
            .play_chunk("これはとても長い文章ですね。", "voice", None)
            .await
            .expect("midpoint splits should succeed");

        let accepted = synth.accepted.lock().unwrap();
        assert!(accepted.len() >= 2);
        assert!(accepted.iter().all(|t| t.chars().count() <= 10));
        assert_eq!(accepted.concat(), "これはとても長い文章ですね。");
    }

    #[tokio::test]
    async fn text_too_short_to_halve_gives_up() {
        // Limit 0 rejects everything; once the halves are single chars there
        // is nothing left to split.
        let synth = Arc::new(PickySynth {
            limit: 0,
            accepted: Mutex::new(Vec::new()),
        });
        let player = ChunkPlayer::new(synth, Arc::new(NullOutput), None, fast_config());

        let err = player.play_chunk("ab", "voice", None).await.unwrap_err();
        assert!(err.is_too_long());
    }

    #[tokio::test]
    async fn stuck_output_times_out_and_is_stopped() {
        let output = Arc::new(StuckOutput {
            stops: AtomicUsize::new(0),
        });
        let avatar = Arc::new(RecordingAvatar::default());
        let player = ChunkPlayer::new(
            Arc::new(InstantSynth),
            output.clone(),
            Some(avatar.clone()),
            fast_config(),
        );

        let err = player.play_chunk("hi", "voice", None).await.unwrap_err();
        assert!(matches!(err, SpeechError::Timeout(_)));
        assert_eq!(output.stops.load(Ordering::SeqCst), 1);

        // The mouth must end closed no matter how playback ended.
        let params = avatar.params.lock().unwrap();
        let last_open = params
            .iter()
            .rev()
            .find(|(name, _)| name == PARAM_MOUTH_OPEN)
            .map(|(_, v)| *v);
        assert_eq!(last_open, Some(0.0));
    }

    #[test]
    fn retry_split_prefers_whitespace_then_the_midpoint() {
        let (head, tail) = split_for_retry("one two three four").expect("splittable");
        assert_eq!(head, "one two");
        assert_eq!(tail, "three four");

        let (head, tail) = split_for_retry("unbroken").expect("midpoint fallback");
        assert_eq!(head, "unbr");
        assert_eq!(tail, "oken");

        assert!(split_for_retry("x").is_none());
    }
}
