//! Turn a campaign step into an outbound message for one recipient.

use crate::store::campaigns::{MessageType, Step};
use crate::store::recipients::Recipient;
use crate::transport::OutboundMessage;

/// Fallback document name when the URL has no usable last segment.
const DEFAULT_FILE_NAME: &str = "document";

/// Substitute `{name}` and `{phone}` into a template.
///
/// A recipient without a name renders `{name}` as an empty string.
pub fn render_text(template: &str, recipient: &Recipient) -> String {
    template
        .replace("{name}", recipient.name.as_deref().unwrap_or_default())
        .replace("{phone}", &recipient.phone_number)
}

/// Build the message for `step`, rendered for `recipient`.
///
/// Media steps use the rendered text as caption; an empty caption is omitted.
pub fn build_message(step: &Step, recipient: &Recipient) -> OutboundMessage {
    let text = render_text(&step.message_text, recipient);
    let caption = (!text.trim().is_empty()).then_some(text.clone());
    match (step.message_type, step.media_url.as_deref()) {
        (MessageType::Image, Some(url)) => OutboundMessage::Image {
            url: url.to_owned(),
            caption,
        },
        (MessageType::Document, Some(url)) => OutboundMessage::Document {
            url: url.to_owned(),
            file_name: step
                .file_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| file_name_from_url(url)),
            caption,
        },
        // Media steps without a URL are rejected at creation; send the text.
        _ => OutboundMessage::Text { text },
    }
}

/// Last path segment of a URL, or a generic name.
pub fn file_name_from_url(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_owned())
}
