//! Id-based reconciliation of an incoming message list against the stored one
//!
//! Stored history is never reordered. An incoming message is appended when it
//! has no id or when its id has not been seen yet; there is no content-based
//! deduplication and conflicting edits under the same id are not reconciled.

use std::collections::HashSet;

use crate::chat_db::schema::Message;

/// Appends the new messages of `incoming` to `existing`.
pub fn merge(existing: Vec<Message>, incoming: Vec<Message>) -> Vec<Message> {
    let mut seen: HashSet<String> = existing
        .iter()
        .filter_map(|msg| msg.id.clone())
        .collect();

    let mut merged = existing;
    merged.reserve(incoming.len());

    for msg in incoming {
        match &msg.id {
            // An id repeated inside `incoming` is stored once.
            Some(id) => {
                if seen.insert(id.clone()) {
                    merged.push(msg);
                }
            }
            None => merged.push(msg),
        }
    }

    merged
}

/// Removes the message with `message_id`. Returns `None` when no message
/// carries that id, leaving the caller's sequence untouched.
pub fn remove(messages: &[Message], message_id: &str) -> Option<Vec<Message>> {
    if !messages.iter().any(|m| m.id.as_deref() == Some(message_id)) {
        return None;
    }
    Some(
        messages
            .iter()
            .filter(|m| m.id.as_deref() != Some(message_id))
            .cloned()
            .collect(),
    )
}
