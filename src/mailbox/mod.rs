//! Mailbox ingestion — the transport boundary, message decoding, and
//! the inbox poll worker.

pub mod imap;
pub mod poller;

pub use imap::ImapTransport;
pub use poller::{InboxPoller, spawn_inbox_poller};

use async_trait::async_trait;
use mail_parser::MessageParser;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::inbound::InboundSignal;

/// Read-side mailbox boundary: list unseen messages, fetch raw content.
#[async_trait]
pub trait MailboxTransport: Send + Sync {
    /// Ids of messages not yet seen, oldest first.
    async fn search_unseen(&self) -> Result<Vec<String>, ChannelError>;

    /// Raw RFC 822 bytes for one message. Fetching marks it seen, so it
    /// will not reappear in the next unseen search.
    async fn fetch(&self, id: &str) -> Result<Vec<u8>, ChannelError>;
}

/// Decode raw message bytes into an inbound signal.
///
/// Multipart messages yield the first `text/plain` subpart; HTML-only
/// messages fall back to tag-stripped text. Returns `None` when the
/// bytes are unparseable or carry no sender address.
pub fn decode_signal(raw: &[u8]) -> Option<InboundSignal> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())?;

    let subject = parsed.subject().unwrap_or("").to_string();

    let body = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .or_else(|| parsed.body_html(0).map(|h| strip_html(h.as_ref())))
        .unwrap_or_default();

    let message_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let in_reply_to = match parsed.in_reply_to() {
        mail_parser::HeaderValue::Text(id) => Some(id.to_string()),
        mail_parser::HeaderValue::TextList(ids) => ids.first().map(|id| id.to_string()),
        _ => None,
    };

    Some(InboundSignal {
        message_id,
        in_reply_to,
        from,
        subject,
        body,
    })
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
