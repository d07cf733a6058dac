//! Text helpers for conversation listings

use std::borrow::Cow;

use crate::chat_db::schema::Message;

/// Maximum preview length, in characters, before the ellipsis
pub const PREVIEW_MAX_CHARS: usize = 80;

/// Preview used when no message carries any text
pub const EMPTY_CONVERSATION: &str = "Empty conversation";

pub struct TextUtils;

impl TextUtils {
    /// Truncate to `max_chars` characters, appending `...` when cut.
    /// Counts characters, not bytes, so multi-byte text never splits.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        match text.char_indices().nth(max_chars) {
            None => Cow::Borrowed(text),
            Some((cut, _)) => {
                let mut result = String::with_capacity(cut + 3);
                result.push_str(&text[..cut]);
                result.push_str("...");
                Cow::Owned(result)
            }
        }
    }

    /// Preview shown in the conversation list.
    ///
    /// Takes the first user message with non-blank content; failing that the
    /// first non-blank message from anyone; failing that [`EMPTY_CONVERSATION`].
    pub fn conversation_preview(messages: &[Message]) -> String {
        let first_text = |want_user: bool| {
            messages
                .iter()
                .filter(|m| !want_user || m.is_from_user())
                .map(|m| m.content.trim())
                .find(|content| !content.is_empty())
        };

        first_text(true)
            .or_else(|| first_text(false))
            .map(|content| Self::truncate_with_ellipsis(content, PREVIEW_MAX_CHARS).into_owned())
            .unwrap_or_else(|| EMPTY_CONVERSATION.to_string())
    }
}
