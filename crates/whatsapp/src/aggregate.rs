//! Flattening a connected socket's chat store into one message list.

use {
    chrono::{DateTime, Duration, Utc},
    serde::Serialize,
    tracing::{debug, warn},
    wagate_channels::{RemoteSocket, SocketError, StoredMessage},
};

/// Inclusive time bounds on message timestamps. Open ends are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl FetchWindow {
    pub fn all() -> Self {
        Self::default()
    }

    /// Everything from `days` days before `now` onwards.
    pub fn days_back(days: u32, now: DateTime<Utc>) -> Self {
        Self {
            since: Some(now - Duration::days(i64::from(days))),
            until: None,
        }
    }

    /// Messages without a timestamp are kept; their age cannot be judged.
    pub fn contains(&self, timestamp: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = timestamp else {
            return true;
        };
        self.since.is_none_or(|since| ts >= since) && self.until.is_none_or(|until| ts <= until)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: Option<String>,
    pub conversation_id: String,
    pub sender_is_self: bool,
    /// Plain text, falling back to extended text, else empty.
    pub body: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageRecord {
    fn project(conversation_id: &str, message: StoredMessage) -> Self {
        let body = message
            .conversation
            .filter(|text| !text.is_empty())
            .or(message.extended_text)
            .unwrap_or_default();
        Self {
            id: message.id,
            conversation_id: conversation_id.to_string(),
            sender_is_self: message.from_me,
            body,
            timestamp: message
                .timestamp
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        }
    }
}

/// A conversation left out of a batch because reading it failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedConversation {
    pub conversation_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatch {
    pub records: Vec<MessageRecord>,
    pub skipped: Vec<SkippedConversation>,
}

impl MessageBatch {
    /// Whether some conversations could not be read.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Walk every conversation in store order and collect its messages.
///
/// A conversation that fails to read is skipped and reported; failing to
/// list conversations at all fails the whole fetch.
pub async fn collect(
    socket: &dyn RemoteSocket,
    session_id: &str,
    window: &FetchWindow,
) -> Result<MessageBatch, SocketError> {
    let conversations = socket.list_conversations().await?;
    let mut batch = MessageBatch::default();

    for conversation in conversations {
        match socket.list_messages(&conversation.id).await {
            Ok(messages) => batch.records.extend(
                messages
                    .into_iter()
                    .map(|m| MessageRecord::project(&conversation.id, m))
                    .filter(|r| window.contains(r.timestamp)),
            ),
            Err(e) => {
                warn!(
                    session_id,
                    conversation_id = %conversation.id,
                    error = %e,
                    "skipping unreadable conversation"
                );
                batch.skipped.push(SkippedConversation {
                    conversation_id: conversation.id,
                    error: e.to_string(),
                });
            },
        }
    }

    debug!(
        session_id,
        records = batch.records.len(),
        skipped = batch.skipped.len(),
        "collected messages"
    );
    Ok(batch)
}
