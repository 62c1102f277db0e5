//! Single-slot prefetch of the next chunk's audio. While one chunk plays,
//! the following chunk's synthesis request runs in the background so playback
//! can hand over without a gap.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::output::AudioClip;
use crate::synth::SpeechSynth;

/// Identity of a prefetched chunk. Any change to position, text, or voice
/// makes a previously fetched clip unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadKey {
    pub chunk_index: usize,
    pub text: String,
    pub voice_id: String,
}

struct Slot {
    key: PreloadKey,
    task: JoinHandle<Option<AudioClip>>,
}

/// Holds at most one in-flight or completed prefetch. Replacing the slot
/// aborts the previous task.
pub struct Preloader {
    synth: Arc<dyn SpeechSynth>,
    slot: Mutex<Option<Slot>>,
}

impl Preloader {
    pub fn new(synth: Arc<dyn SpeechSynth>) -> Self {
        Self {
            synth,
            slot: Mutex::new(None),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Slot>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start fetching audio for `key` unless an identical prefetch is already
    /// in the slot. Synthesis errors are swallowed here; the player will hit
    /// the same error itself when it falls back to a direct fetch.
    pub fn preload(&self, key: PreloadKey) {
        let mut slot = self.lock_slot();
        if let Some(existing) = slot.as_ref() {
            if existing.key == key {
                return;
            }
            existing.task.abort();
        }

        let synth = self.synth.clone();
        let text = key.text.clone();
        let voice_id = key.voice_id.clone();
        let chunk_index = key.chunk_index;
        let task = tokio::spawn(async move {
            match synth.synthesize(&text, &voice_id).await {
                Ok(clip) => clip,
                Err(err) => {
                    tracing::warn!(chunk_index, %err, "prefetch failed");
                    None
                }
            }
        });
        *slot = Some(Slot { key, task });
    }

    /// Take the prefetched clip if the slot matches `key`. A mismatched slot
    /// is left in place for whichever chunk it actually belongs to.
    pub async fn take(&self, key: &PreloadKey) -> Option<AudioClip> {
        let slot = {
            let mut guard = self.lock_slot();
            match guard.take() {
                Some(slot) if slot.key == *key => slot,
                other => {
                    *guard = other;
                    return None;
                }
            }
        };
        match slot.task.await {
            Ok(clip) => clip,
            // Abort raced with take; treat it as a miss.
            Err(_) => None,
        }
    }

    /// Drop whatever is in the slot and cancel its task.
    pub fn clear(&self) {
        if let Some(slot) = self.lock_slot().take() {
            slot.task.abort();
        }
    }
}

impl Drop for Preloader {
    fn drop(&mut self) {
        self.clear();
    }
}
