//! Size bounding for persisted conversation state.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::CheckpointConfig;
use crate::domain::conversation::ConversationState;

pub const IMAGE_PLACEHOLDER: &str = "[image data removed]";
pub const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub skipped: bool,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub messages_before: usize,
    pub messages_after: usize,
    pub truncated_messages: usize,
    pub stripped_images: usize,
}

fn image_data_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/=]+").ok())
        .as_ref()
}

/// Compacts `state` in place.
///
/// Keeps the newest `max_messages` messages, truncates overlong message text,
/// and replaces inline base64 images with a placeholder in messages and in
/// non-critical metadata. Customer contact, selected products, the current
/// state, the pending approval and `critical_metadata_keys` are never touched.
pub fn compact(state: &mut ConversationState, config: &CheckpointConfig) -> CompactionReport {
    let bytes_before = payload_size(state);
    let messages_before = state.messages.len();

    if !config.enabled {
        return CompactionReport {
            skipped: true,
            bytes_before,
            bytes_after: bytes_before,
            messages_before,
            messages_after: messages_before,
            ..CompactionReport::default()
        };
    }

    let mut report = CompactionReport { bytes_before, messages_before, ..Default::default() };

    if state.messages.len() > config.max_messages {
        let excess = state.messages.len() - config.max_messages;
        state.messages.drain(..excess);
    }

    for message in &mut state.messages {
        let (stripped, images) = strip_image_data(&message.content);
        if images > 0 {
            report.stripped_images += images;
            message.content = stripped.into_owned();
        }
        if let Some(truncated) = truncate_chars(&message.content, config.max_message_chars) {
            message.content = truncated;
            report.truncated_messages += 1;
        }
    }

    for (key, value) in state.metadata.iter_mut() {
        if config.critical_metadata_keys.iter().any(|critical| critical == key) {
            continue;
        }
        report.stripped_images += compact_value(value, config.max_message_chars);
    }

    report.messages_after = state.messages.len();
    report.bytes_after = payload_size(state);

    info!(
        event_name = "checkpoint.compaction.applied",
        session_id = %state.session_id,
        bytes_before = report.bytes_before,
        bytes_after = report.bytes_after,
        messages_before = report.messages_before,
        messages_after = report.messages_after,
        truncated_messages = report.truncated_messages,
        stripped_images = report.stripped_images,
        "conversation checkpoint compacted"
    );

    report
}

fn payload_size(state: &ConversationState) -> usize {
    serde_json::to_vec(state).map(|bytes| bytes.len()).unwrap_or(0)
}

fn strip_image_data(text: &str) -> (Cow<'_, str>, usize) {
    let Some(pattern) = image_data_pattern() else {
        return (Cow::Borrowed(text), 0);
    };
    let count = pattern.find_iter(text).count();
    if count == 0 {
        return (Cow::Borrowed(text), 0);
    }
    (pattern.replace_all(text, IMAGE_PLACEHOLDER), count)
}

/// Returns the shortened text when `text` has more than `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> Option<String> {
    let (cut, _) = text.char_indices().nth(max_chars)?;
    let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
    truncated.push_str(&text[..cut]);
    truncated.push_str(TRUNCATION_MARKER);
    Some(truncated)
}

fn compact_value(value: &mut Value, max_chars: usize) -> usize {
    match value {
        Value::String(text) => {
            let (stripped, images) = strip_image_data(text);
            let mut next = stripped.into_owned();
            if let Some(truncated) = truncate_chars(&next, max_chars) {
                next = truncated;
            }
            *text = next;
            images
        }
        Value::Array(items) => items.iter_mut().map(|item| compact_value(item, max_chars)).sum(),
        Value::Object(fields) => {
            fields.values_mut().map(|item| compact_value(item, max_chars)).sum()
        }
        _ => 0,
    }
}
