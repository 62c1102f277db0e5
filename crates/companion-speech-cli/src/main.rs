use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use companion_speech::{
    AudioOutput, AvatarSink, BackendConfig, ChunkPlayer, Config, HttpSynth, NullOutput,
    PlaybackRequest, QueueStatus, SpeechConfig, SpeechQueue, SpeechSynth, UiSink,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Companion speech playback client", long_about = None)]
struct Args {
    /// TOML config file: backend endpoint, voice table, and a [speech]
    /// section of pipeline tunables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Synthesis endpoint, overriding the config file.
    #[arg(long)]
    url: Option<String>,

    /// Voice id, overriding the per-language lookup.
    #[arg(long)]
    voice: Option<String>,

    /// Language code used for voice lookup, e.g. "en-US".
    #[arg(long, default_value = "en-US")]
    language: String,

    /// Discard audio instead of playing it.
    #[arg(long)]
    no_play: bool,

    /// Log avatar mouth parameters instead of driving a model.
    #[arg(long)]
    mouth_debug: bool,

    /// Text to speak. Reads lines from stdin when omitted.
    text: Option<String>,
}

/// UI sink for a terminal session: highlights become debug logs, a rate
/// limit prints a retry hint and remembers where to pick back up.
#[derive(Default)]
struct TerminalUi {
    retry: Mutex<Option<(String, usize, String)>>,
}

impl TerminalUi {
    fn take_retry(&self) -> Option<(String, usize, String)> {
        match self.retry.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl UiSink for TerminalUi {
    fn highlight(&self, message_id: &str, sentence_index: Option<usize>, _append: bool) {
        match sentence_index {
            Some(index) => tracing::debug!(message_id, sentence = index, "speaking"),
            None => tracing::debug!(message_id, "done"),
        }
    }

    fn show_retry(&self, message_id: &str, resume_sentence_index: usize, language_code: &str) {
        tracing::warn!(
            message_id,
            resume_sentence_index,
            "rate limited; type :retry to resume"
        );
        if let Ok(mut guard) = self.retry.lock() {
            *guard = Some((
                message_id.to_string(),
                resume_sentence_index,
                language_code.to_string(),
            ));
        }
    }

    fn clear_highlights(&self) {}

    fn set_loading(&self, loading: bool) {
        tracing::debug!(loading, "synthesis in flight");
    }
}

/// Avatar stand-in that logs the mouth parameters as they are driven.
struct LogAvatar;

impl AvatarSink for LogAvatar {
    fn set_parameter(&self, name: &str, value: f32) {
        tracing::debug!(name, value, "avatar parameter");
    }
}

fn build_output(no_play: bool) -> Result<Arc<dyn AudioOutput>> {
    if no_play {
        return Ok(Arc::new(NullOutput));
    }
    #[cfg(feature = "playback")]
    {
        Ok(Arc::new(companion_speech::CpalOutput::setup()?))
    }
    #[cfg(not(feature = "playback"))]
    {
        tracing::warn!("built without playback support, discarding audio");
        Ok(Arc::new(NullOutput))
    }
}

async fn wait_until_quiet(queue: &SpeechQueue) -> QueueStatus {
    loop {
        match queue.status() {
            QueueStatus::Draining => tokio::time::sleep(Duration::from_millis(50)).await,
            status => return status,
        }
    }
}

async fn interactive(queue: SpeechQueue, ui: Arc<TerminalUi>, language: String) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut texts: HashMap<String, String> = HashMap::new();
    let mut next_id = 0usize;

    println!("type text to speak; :pause :resume :retry :stop :quit");
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            ":quit" => break,
            ":pause" => queue.pause(),
            ":resume" => queue.resume_pending(),
            ":stop" => queue.stop(),
            ":retry" => match ui.take_retry() {
                Some((message_id, sentence_index, language_code)) => {
                    match texts.get(&message_id) {
                        Some(text) => {
                            queue.resume(&message_id, text, &language_code, sentence_index)
                        }
                        None => tracing::warn!(message_id, "nothing to retry"),
                    }
                }
                None => tracing::info!("nothing to retry"),
            },
            text => {
                next_id += 1;
                let message_id = format!("line-{next_id}");
                texts.insert(message_id.clone(), text.to_string());
                queue.enqueue(PlaybackRequest::new(message_id, text, &language));
            }
        }
    }
    queue.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (mut backend, config) = match &args.config {
        Some(path) => {
            let file = Config::load(path)?;
            (file.backend, file.speech)
        }
        None => (BackendConfig::default(), SpeechConfig::default()),
    };
    if let Some(url) = args.url {
        backend.api_url = url;
    }

    let ui = Arc::new(TerminalUi::default());
    let synth: Arc<dyn SpeechSynth> = Arc::new(HttpSynth::new(backend.clone(), ui.clone()));
    let output = build_output(args.no_play)?;
    let avatar: Option<Arc<dyn AvatarSink>> = if args.mouth_debug {
        Some(Arc::new(LogAvatar))
    } else {
        None
    };

    let player = ChunkPlayer::new(synth.clone(), output.clone(), avatar, config.clone());
    let queue = SpeechQueue::new(synth, output, ui.clone(), player, config, backend);
    if args.voice.is_some() {
        queue.set_voice(args.voice.clone());
    }

    match args.text {
        Some(text) => {
            queue.enqueue(PlaybackRequest::new("cli", text, &args.language));
            if wait_until_quiet(&queue).await == QueueStatus::Paused {
                anyhow::bail!("playback was rate limited; try again later");
            }
            Ok(())
        }
        None => interactive(queue, ui, args.language).await,
    }
}
