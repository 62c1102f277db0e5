//! Text-to-speech playback pipeline for a virtual companion.
//!
//! An AI reply goes in one end as a [`PlaybackRequest`]; out the other come
//! synthesized audio on the shared output, sentence highlights for the chat
//! UI, and mouth parameters for the avatar. The pipeline segments the reply
//! into sentences, groups them into backend-sized chunks, prefetches the next
//! chunk while the current one plays, and survives backend rate limits with
//! a user-facing resume point.

pub mod config;
pub mod error;
pub mod output;
pub mod player;
pub mod preload;
pub mod queue;
pub mod segment;
pub mod sink;
pub mod synth;

pub use config::{BackendConfig, Config, SpeechConfig, SynthSettings};
pub use error::{Result, SpeechError};
pub use output::{AudioClip, AudioOutput, MouthLevel, NullOutput};
pub use player::ChunkPlayer;
pub use preload::{PreloadKey, Preloader};
pub use queue::{PlaybackRequest, QueueStatus, SpeechQueue};
pub use segment::{clean_reply, group_chunks, split_sentences, Chunk};
pub use sink::{AvatarSink, NullUi, UiSink, PARAM_MOUTH_FORM, PARAM_MOUTH_OPEN};
pub use synth::{HttpSynth, SpeechSynth};

#[cfg(feature = "playback")]
pub use output::CpalOutput;
