//! Outbound content instrumentation — click-redirect rewriting and the
//! open-tracking pixel.
//!
//! Tracking is best-effort, delivery is not: content that cannot be
//! rewritten is sent as-is with a warning, never dropped.

use tracing::warn;

/// 1×1 transparent GIF served inline as the open-tracking pixel.
const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];

/// Inline image attachment descriptor for the tracking pixel.
#[derive(Debug, Clone)]
pub struct PixelAttachment {
    pub content_id: String,
    pub bytes: &'static [u8],
}

/// Result of instrumenting one outbound message.
#[derive(Debug, Clone)]
pub struct Instrumented {
    pub html: String,
    pub pixel: PixelAttachment,
}

/// Rewrites outbound HTML with click tracking and an open pixel.
pub struct TrackingRewriter {
    base_url: String,
    /// Host suffixes that must never be routed through the redirect
    /// (recipients go straight to the booking page).
    allowed_hosts: Vec<String>,
}

impl TrackingRewriter {
    pub fn new(base_url: impl Into<String>, scheduling_domain: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            allowed_hosts: vec![scheduling_domain.into().to_lowercase()],
        }
    }

    /// Instrument content with the given tracking id. Safe to re-apply:
    /// already-rewritten links and an already-present pixel are left
    /// alone.
    pub fn instrument(&self, html: &str, tracking_id: &str) -> Instrumented {
        let rewritten = match self.rewrite_links(html, tracking_id) {
            Some(out) => out,
            None => {
                warn!(tracking_id, "Unparseable markup, sending without click tracking");
                html.to_string()
            }
        };

        Instrumented {
            html: self.insert_pixel(rewritten, tracking_id),
            pixel: PixelAttachment {
                content_id: format!("tracking_pixel_{tracking_id}"),
                bytes: PIXEL_GIF,
            },
        }
    }

    /// The redirect URL a given original URL is rewritten to.
    pub fn click_url(&self, tracking_id: &str, original: &str) -> String {
        format!(
            "{}/track/click/{}?url={}",
            self.base_url,
            tracking_id,
            percent_encode(original)
        )
    }

    fn open_url(&self, tracking_id: &str) -> String {
        format!("{}/track/open/{}", self.base_url, tracking_id)
    }

    /// Rewrite all `href` values not on the allow-list. Returns `None`
    /// when the markup is malformed (unclosed attribute quote).
    fn rewrite_links(&self, html: &str, tracking_id: &str) -> Option<String> {
        let mut out = String::with_capacity(html.len());
        let mut rest = html;

        while let Some(pos) = rest.find("href=\"") {
            let value_start = pos + "href=\"".len();
            out.push_str(&rest[..value_start]);
            rest = &rest[value_start..];

            // Unclosed attribute — bail out, caller falls back to the
            // unmodified content.
            let value_end = rest.find('"')?;
            let url = &rest[..value_end];

            if self.should_rewrite(url) {
                out.push_str(&self.click_url(tracking_id, url));
            } else {
                out.push_str(url);
            }
            rest = &rest[value_end..];
        }

        out.push_str(rest);
        Some(out)
    }

    fn should_rewrite(&self, url: &str) -> bool {
        // Already instrumented — idempotent re-application
        if url.starts_with(&self.base_url) {
            return false;
        }
        // Only absolute http(s) links can be usefully redirected
        let Some(host) = host_of(url) else {
            return false;
        };
        !self
            .allowed_hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
    }

    fn insert_pixel(&self, html: String, tracking_id: &str) -> String {
        let pixel = format!(
            r#"<img src="{}" width="1" height="1" />"#,
            self.open_url(tracking_id)
        );

        // Re-application guard
        if html.contains(&pixel) {
            return html;
        }

        match find_case_insensitive(&html, "</body>") {
            Some(pos) => {
                let mut out = String::with_capacity(html.len() + pixel.len());
                out.push_str(&html[..pos]);
                out.push_str(&pixel);
                out.push_str(&html[pos..]);
                out
            }
            None => {
                // No closing body marker; append so opens still register
                let mut out = html;
                out.push_str(&pixel);
                out
            }
        }
    }
}

/// Lowercased host of an absolute http(s) URL, without port.
fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host_port = rest.split(['/', '?', '#']).next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_lowercase().find(&needle.to_lowercase())
}

/// Percent-encode a URL for embedding as a query parameter value.
/// RFC 3986 unreserved characters pass through.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> TrackingRewriter {
        TrackingRewriter::new("https://track.example", "calendly.com")
    }

    #[test]
    fn rewrites_external_links() {
        let html = r#"<p>Click <a href="https://example.com/pricing">here</a></p>"#;
        let result = rewriter().instrument(html, "t-1");

        assert!(result.html.contains(
            "https://track.example/track/click/t-1?url=https%3A%2F%2Fexample.com%2Fpricing"
        ));
        assert!(!result.html.contains(r#"href="https://example.com/pricing""#));
    }

    #[test]
    fn scheduling_links_pass_through() {
        let html = r#"<a href="https://calendly.com/louis/demo">Book a demo</a>"#;
        let result = rewriter().instrument(html, "t-1");

        assert!(result.html.contains(r#"href="https://calendly.com/louis/demo""#));
        assert!(!result.html.contains("/track/click/"));
    }

    #[test]
    fn scheduling_subdomain_passes_through() {
        let html = r#"<a href="https://www.calendly.com/louis">Book</a>"#;
        let result = rewriter().instrument(html, "t-1");
        assert!(!result.html.contains("/track/click/"));
    }

    #[test]
    fn lookalike_domain_is_rewritten() {
        let html = r#"<a href="https://evilcalendly.com/x">Book</a>"#;
        let result = rewriter().instrument(html, "t-1");
        assert!(result.html.contains("/track/click/"));
    }

    #[test]
    fn pixel_inserted_before_closing_body() {
        let html = "<html><body><p>hi</p></body></html>";
        let result = rewriter().instrument(html, "t-1");

        let pixel_pos = result.html.find("/track/open/t-1").unwrap();
        let body_pos = result.html.find("</body>").unwrap();
        assert!(pixel_pos < body_pos);
    }

    #[test]
    fn pixel_appended_when_no_body_marker() {
        let html = "<p>fragment only</p>";
        let result = rewriter().instrument(html, "t-1");
        assert!(result.html.ends_with(r#"width="1" height="1" />"#));
    }

    #[test]
    fn instrumenting_twice_is_idempotent() {
        let html = r#"<body><a href="https://example.com/a">a</a></body>"#;
        let rewriter = rewriter();

        let once = rewriter.instrument(html, "t-1");
        let twice = rewriter.instrument(&once.html, "t-1");

        assert_eq!(once.html, twice.html);
        assert_eq!(twice.html.matches("/track/click/").count(), 1);
        assert_eq!(twice.html.matches("/track/open/").count(), 1);
    }

    #[test]
    fn relative_and_mailto_links_untouched() {
        let html = r##"<a href="/local">l</a> <a href="mailto:a@x.com">m</a> <a href="#top">t</a>"##;
        let result = rewriter().instrument(html, "t-1");
        assert!(!result.html.contains("/track/click/"));
    }

    #[test]
    fn unclosed_href_falls_back_to_original_links() {
        let html = r#"<body><a href="https://example.com/broken>text</a></body>"#;
        let result = rewriter().instrument(html, "t-1");

        // Original markup preserved, pixel still added
        assert!(result.html.contains("https://example.com/broken"));
        assert!(!result.html.contains("/track/click/"));
        assert!(result.html.contains("/track/open/t-1"));
    }

    #[test]
    fn multiple_links_each_rewritten() {
        let html = r#"<a href="https://a.example/1">1</a><a href="https://b.example/2">2</a>"#;
        let result = rewriter().instrument(html, "t-1");
        assert_eq!(result.html.matches("/track/click/t-1").count(), 2);
    }

    #[test]
    fn pixel_descriptor_carries_content_id() {
        let result = rewriter().instrument("<body></body>", "abc");
        assert_eq!(result.pixel.content_id, "tracking_pixel_abc");
        assert!(!result.pixel.bytes.is_empty());
    }

    #[test]
    fn encoded_url_round_trips() {
        let original = "https://example.com/path?q=1&r=two three";
        let encoded = percent_encode(original);
        assert!(!encoded.contains('&'));
        assert!(!encoded.contains(' '));

        // Decode the way the redirect endpoint's query parser would
        let decoded = decode(&encoded);
        assert_eq!(decoded, original);
    }

    fn decode(s: &str) -> String {
        let mut out = Vec::new();
        let mut bytes = s.bytes();
        while let Some(b) = bytes.next() {
            if b == b'%' {
                let hi = bytes.next().unwrap();
                let lo = bytes.next().unwrap();
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).unwrap();
                out.push(u8::from_str_radix(hex, 16).unwrap());
            } else {
                out.push(b);
            }
        }
        String::from_utf8(out).unwrap()
    }
}
