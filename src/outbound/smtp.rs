//! SMTP delivery via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::error::DeliveryError;
use crate::outbound::{Mailer, SendReceipt};
use crate::tracking::PixelAttachment;

/// Sends outbound mail over the configured SMTP relay.
///
/// The Message-ID is generated locally so the stored record can be
/// matched against inbound `In-Reply-To` headers later.
pub struct SmtpMailer {
    config: MailboxConfig,
}

impl SmtpMailer {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

/// Domain part of an address, for Message-ID generation.
fn address_domain(address: &str) -> &str {
    address.rsplit('@').next().unwrap_or("localhost")
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        pixel: Option<&PixelAttachment>,
    ) -> Result<SendReceipt, DeliveryError> {
        let send_failed = |reason: String| DeliveryError::SendFailed {
            recipient: to.to_string(),
            reason,
        };

        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|e| send_failed(format!("Invalid from address: {e}")))?;
        let recipient: Mailbox = to
            .parse()
            .map_err(|e| send_failed(format!("Invalid recipient address: {e}")))?;

        let message_id = format!(
            "{}@{}",
            Uuid::new_v4(),
            address_domain(&self.config.from_address)
        );

        let html_part = SinglePart::builder()
            .header(ContentType::TEXT_HTML)
            .body(html.to_string());

        let body = match pixel {
            Some(pixel) => {
                let gif = ContentType::parse("image/gif")
                    .map_err(|e| send_failed(format!("Invalid pixel content type: {e}")))?;
                MultiPart::related().singlepart(html_part).singlepart(
                    Attachment::new_inline(pixel.content_id.clone())
                        .body(pixel.bytes.to_vec(), gif),
                )
            }
            None => MultiPart::related().singlepart(html_part),
        };

        let email = Message::builder()
            .from(from)
            .to(recipient)
            .subject(subject)
            .message_id(Some(format!("<{message_id}>")))
            .multipart(body)
            .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        transport
            .send(&email)
            .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

        info!(recipient = %to, message_id = %message_id, "Email sent");
        Ok(SendReceipt { message_id })
    }
}
