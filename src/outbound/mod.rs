//! Outbound delivery — the `Mailer` transport seam, content rendering,
//! and the campaign send path.

pub mod outbox;
pub mod provider;
pub mod render;
pub mod smtp;

pub use outbox::Outbox;
pub use provider::HttpApiMailer;
pub use render::{ContentRenderer, RenderedEmail, TemplateRenderer};
pub use smtp::SmtpMailer;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::tracking::PixelAttachment;

/// Transport-level receipt for one accepted message.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Normalized Message-ID (no angle brackets) assigned to the send.
    /// Inbound `In-Reply-To` headers and provider webhooks reference it.
    pub message_id: String,
}

/// Outbound mail transport boundary.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one HTML message. The pixel, when given, travels as an
    /// inline attachment alongside the remote pixel reference in the
    /// body.
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        pixel: Option<&PixelAttachment>,
    ) -> Result<SendReceipt, DeliveryError>;
}
