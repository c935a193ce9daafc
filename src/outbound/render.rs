//! Follow-up and courtesy email content.
//!
//! Copy generation is a collaborator boundary; anything producing
//! campaign-specific wording lives behind `ContentRenderer`.
//! `TemplateRenderer` carries the stock cadence copy used when no
//! external generator is wired in.

use async_trait::async_trait;

/// A rendered subject + HTML body pair.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Produces outbound email content.
#[async_trait]
pub trait ContentRenderer: Send + Sync {
    /// Content for a cadence follow-up, selected by sequence number.
    async fn follow_up(&self, sequence: i64) -> RenderedEmail;

    /// Confirmation sent when an invitee books a demo slot.
    async fn booking_confirmation(&self, name: &str, start_time: &str) -> RenderedEmail;

    /// Nudge sent when an invitee cancels their booking.
    async fn cancellation_follow_up(&self) -> RenderedEmail;
}

/// Static template renderer with the stock three-step cadence.
pub struct TemplateRenderer {
    booking_url: String,
}

impl TemplateRenderer {
    pub fn new(booking_url: impl Into<String>) -> Self {
        Self {
            booking_url: booking_url.into(),
        }
    }
}

#[async_trait]
impl ContentRenderer for TemplateRenderer {
    async fn follow_up(&self, sequence: i64) -> RenderedEmail {
        let (subject, body) = match sequence {
            3 => (
                "Still interested in modernizing your practice?",
                "<p>I wanted to follow up on my previous email about modernizing your \
                 medical practice.</p>\
                 <p>Many practices we work with were initially hesitant about implementing \
                 AI solutions, but after seeing a demo they were amazed by how simple and \
                 effective it is.</p>\
                 <p>Would you be interested in a quick 5-minute demo?</p>"
                    .to_string(),
            ),
            7 => (
                "Quick update on practice automation",
                "<p>I thought you might be interested in some recent results from our \
                 medical practice clients:</p>\
                 <ul>\
                 <li>60% reduction in phone calls</li>\
                 <li>40% fewer missed appointments</li>\
                 <li>24/7 patient support without additional staff</li>\
                 </ul>\
                 <p>Would you like to see how we achieved these results?</p>"
                    .to_string(),
            ),
            _ => (
                "One last thing about practice efficiency",
                "<p>I'll keep this brief - this is my final follow-up.</p>\
                 <p>If you're still interested in modernizing your practice with AI \
                 solutions, our offer for a free demo still stands.</p>\
                 <p>Just reply to this email, and I'll take care of the rest.</p>"
                    .to_string(),
            ),
        };

        RenderedEmail {
            subject: subject.to_string(),
            html: wrap(&body),
        }
    }

    async fn booking_confirmation(&self, name: &str, start_time: &str) -> RenderedEmail {
        let body = format!(
            "<p>Hi {name},</p>\
             <p>Thank you for scheduling a demo! I'm looking forward to showing you how \
             we can help modernize your practice.</p>\
             <p>Your demo is scheduled for: <strong>{start_time}</strong></p>\
             <p>To help me prepare, could you reply with your current practice management \
             software and any specific challenges you'd like to address?</p>"
        );

        RenderedEmail {
            subject: "Demo Confirmed - AI Practice Solutions".to_string(),
            html: wrap(&body),
        }
    }

    async fn cancellation_follow_up(&self) -> RenderedEmail {
        let body = format!(
            "<p>Hi there,</p>\
             <p>I noticed you canceled your demo. I understand that schedules can be \
             busy!</p>\
             <p>Would you like to reschedule for a more convenient time? You can book \
             directly here:</p>\
             <p><a href=\"{}\">Reschedule Demo</a></p>\
             <p>Or if there's something specific you'd like to discuss first, just reply \
             to this email.</p>",
            self.booking_url
        );

        RenderedEmail {
            subject: "Sorry we missed you - Reschedule your demo".to_string(),
            html: wrap(&body),
        }
    }
}

fn wrap(body: &str) -> String {
    format!(
        "<html><body style=\"font-family: Arial, sans-serif; line-height: 1.6; \
         color: #333;\">{body}</body></html>"
    )
}
