//! The playback queue. Requests are drained one at a time by a background
//! task; each request is cleaned, segmented into sentences, grouped into
//! chunks, and played chunk by chunk with the next chunk prefetching while
//! the current one speaks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{BackendConfig, SpeechConfig};
use crate::output::AudioOutput;
use crate::player::ChunkPlayer;
use crate::preload::{PreloadKey, Preloader};
use crate::segment::{clean_reply, group_chunks, split_sentences};
use crate::sink::UiSink;
use crate::synth::SpeechSynth;

/// One message to speak. `start_sentence_index` skips sentences that already
/// played, which is how a rate-limited message resumes.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub message_id: String,
    pub text: String,
    pub language_code: String,
    pub start_sentence_index: usize,
}

impl PlaybackRequest {
    pub fn new(message_id: impl Into<String>, text: impl Into<String>, language_code: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            text: text.into(),
            language_code: language_code.into(),
            start_sentence_index: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Idle,
    Draining,
    Paused,
}

struct QueueInner {
    pending: Mutex<VecDeque<PlaybackRequest>>,
    processing: AtomicBool,
    cancelled: AtomicBool,
    paused: AtomicBool,
    selected_voice: Mutex<Option<String>>,
    preloader: Preloader,
    player: ChunkPlayer,
    output: Arc<dyn AudioOutput>,
    ui: Arc<dyn UiSink>,
    config: SpeechConfig,
    backend: BackendConfig,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to the playback pipeline. Cheap to clone; all clones share the
/// same queue and output.
#[derive(Clone)]
pub struct SpeechQueue {
    inner: Arc<QueueInner>,
}

impl SpeechQueue {
    pub fn new(
        synth: Arc<dyn SpeechSynth>,
        output: Arc<dyn AudioOutput>,
        ui: Arc<dyn UiSink>,
        player: ChunkPlayer,
        config: SpeechConfig,
        backend: BackendConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(VecDeque::new()),
                processing: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                selected_voice: Mutex::new(None),
                preloader: Preloader::new(synth),
                player,
                output,
                ui,
                config,
                backend,
            }),
        }
    }

    /// Override the voice for every subsequent request. `None` restores the
    /// per-language lookup.
    pub fn set_voice(&self, voice_id: Option<String>) {
        *lock(&self.inner.selected_voice) = voice_id;
    }

    /// Queue a message for playback. Starts the drain task unless the queue
    /// is paused, in which case the request waits for [`resume_pending`].
    ///
    /// [`resume_pending`]: Self::resume_pending
    pub fn enqueue(&self, request: PlaybackRequest) {
        lock(&self.inner.pending).push_back(request);
        Self::kick(&self.inner);
    }

    /// Resume a message that was interrupted by a rate limit, picking up at
    /// the sentence the retry affordance carries. Jumps the line ahead of
    /// anything else waiting.
    pub fn resume(
        &self,
        message_id: impl Into<String>,
        text: impl Into<String>,
        language_code: impl Into<String>,
        resume_sentence_index: usize,
    ) {
        let request = PlaybackRequest {
            message_id: message_id.into(),
            text: text.into(),
            language_code: language_code.into(),
            start_sentence_index: resume_sentence_index,
        };
        self.inner.paused.store(false, Ordering::Release);
        lock(&self.inner.pending).push_front(request);
        Self::kick(&self.inner);
    }

    /// Stop the current chunk but keep everything queued. The drain task
    /// exits; [`resume_pending`] picks the queue back up.
    ///
    /// [`resume_pending`]: Self::resume_pending
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.output.stop();
    }

    /// Restart draining after a pause.
    pub fn resume_pending(&self) {
        self.inner.paused.store(false, Ordering::Release);
        Self::kick(&self.inner);
    }

    /// Abandon everything: current chunk, queued requests, the prefetch
    /// slot, and any sentence highlights.
    pub fn stop(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);
        lock(&self.inner.pending).clear();
        self.inner.preloader.clear();
        self.inner.output.stop();
        self.inner.ui.clear_highlights();
    }

    pub fn status(&self) -> QueueStatus {
        if self.inner.paused.load(Ordering::Acquire) {
            QueueStatus::Paused
        } else if self.inner.processing.load(Ordering::Acquire) {
            QueueStatus::Draining
        } else {
            QueueStatus::Idle
        }
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    fn kick(inner: &Arc<QueueInner>) {
        if inner.paused.load(Ordering::Acquire) {
            return;
        }
        if inner.processing.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.cancelled.store(false, Ordering::Release);

        let inner = inner.clone();
        tokio::spawn(async move {
            while !halted(&inner) {
                let request = lock(&inner.pending).pop_front();
                let Some(request) = request else { break };
                run_request(&inner, request).await;
            }
            inner.processing.store(false, Ordering::Release);

            // A request may have arrived while the loop was winding down;
            // kick() re-checks the paused flag itself.
            if !lock(&inner.pending).is_empty() {
                Self::kick(&inner);
            }
        });
    }
}

/// True when the current drain should wind down: an explicit pause or stop,
/// or the rate-limit path inside [`run_request`].
fn halted(inner: &QueueInner) -> bool {
    inner.cancelled.load(Ordering::Acquire) || inner.paused.load(Ordering::Acquire)
}

async fn run_request(inner: &Arc<QueueInner>, request: PlaybackRequest) {
    let cleaned = clean_reply(&request.text);
    let sentences = split_sentences(&cleaned);
    if sentences.is_empty() {
        return;
    }

    let voice = {
        let selected = lock(&inner.selected_voice);
        inner
            .backend
            .voice_for(&request.language_code, selected.as_deref())
    };
    let chunks = group_chunks(
        &sentences,
        inner.config.chunk_char_limit,
        request.start_sentence_index,
    );
    tracing::debug!(
        message_id = %request.message_id,
        sentences = sentences.len(),
        chunks = chunks.len(),
        %voice,
        "draining request"
    );

    for (i, chunk) in chunks.iter().enumerate() {
        if halted(inner) {
            return;
        }

        for &sentence in &chunk.sentence_indices {
            inner.ui.highlight(&request.message_id, Some(sentence), true);
        }

        let key = PreloadKey {
            chunk_index: i,
            text: chunk.text.clone(),
            voice_id: voice.clone(),
        };
        let prefetched = inner.preloader.take(&key).await;

        // Fetch the next chunk while this one speaks.
        if let Some(next) = chunks.get(i + 1) {
            inner.preloader.preload(PreloadKey {
                chunk_index: i + 1,
                text: next.text.clone(),
                voice_id: voice.clone(),
            });
        }

        match inner.player.play_chunk(&chunk.text, &voice, prefetched).await {
            Ok(()) => {}
            Err(err) if err.is_rate_limited() => {
                let resume_at = chunk.sentence_indices.first().copied().unwrap_or(0);
                tracing::warn!(
                    message_id = %request.message_id,
                    resume_at,
                    "rate limited, pausing queue"
                );
                inner.paused.store(true, Ordering::Release);
                inner.cancelled.store(true, Ordering::Release);
                inner.preloader.clear();
                inner
                    .ui
                    .show_retry(&request.message_id, resume_at, &request.language_code);
                return;
            }
            Err(err) => {
                tracing::warn!(
                    message_id = %request.message_id,
                    chunk = i,
                    %err,
                    "chunk failed, skipping"
                );
            }
        }

        if halted(inner) {
            return;
        }
        if i + 1 < chunks.len() {
            tokio::time::sleep(Duration::from_millis(inner.config.inter_chunk_pause_ms)).await;
        }
    }

    inner.ui.highlight(&request.message_id, None, false);
}
