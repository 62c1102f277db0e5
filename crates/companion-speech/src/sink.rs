//! Seams to the avatar renderer and the chat UI. The pipeline only ever talks
//! to these traits; the host application decides what they drive.

/// Avatar mouth-open parameter, written every animation tick during playback.
pub const PARAM_MOUTH_OPEN: &str = "ParamMouthOpenY";
/// Avatar mouth-form parameter, scaled from the same level.
pub const PARAM_MOUTH_FORM: &str = "ParamMouthForm";

/// Named-parameter interface of the avatar model. Absent entirely when no
/// avatar is attached; the player tolerates that.
pub trait AvatarSink: Send + Sync {
    fn set_parameter(&self, name: &str, value: f32);
}

/// Notifications to the chat UI. All methods are fire-and-forget; the pipeline
/// never depends on them for correctness.
pub trait UiSink: Send + Sync {
    /// Mark a sentence of a message as currently speaking. A `None` index
    /// clears the message's highlights; `append` keeps earlier ones.
    fn highlight(&self, message_id: &str, sentence_index: Option<usize>, append: bool);

    /// Offer the user a way to resume a rate-limited message from the given
    /// sentence index.
    fn show_retry(&self, message_id: &str, resume_sentence_index: usize, language_code: &str);

    /// Remove every active highlight, regardless of message.
    fn clear_highlights(&self);

    /// Toggle a loading indicator while a synthesis request is in flight.
    fn set_loading(&self, loading: bool);
}

/// No-op UI sink for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUi;

impl UiSink for NullUi {
    fn highlight(&self, _message_id: &str, _sentence_index: Option<usize>, _append: bool) {}
    fn show_retry(&self, _message_id: &str, _resume_sentence_index: usize, _language_code: &str) {}
    fn clear_highlights(&self) {}
    fn set_loading(&self, _loading: bool) {}
}
