//! Image handling for providers without vision support.

use super::provider::ProviderDescriptor;
use crate::MessagePayload;

use std::borrow::Cow;

/// Text appended in place of each image a provider cannot see.
pub const IMAGE_PLACEHOLDER: &str = "[User sent an image that this model cannot see]";

/// Payload as it should be sent to `provider`. Borrowed when nothing changes.
pub fn prepare_for<'a>(
    provider: &ProviderDescriptor,
    payload: &'a MessagePayload,
) -> Cow<'a, MessagePayload> {
    if provider.supports_vision() || !payload.has_images() {
        Cow::Borrowed(payload)
    } else {
        tracing::debug!(provider = %provider.name, "stripping images for non-vision provider");
        Cow::Owned(strip_images(payload))
    }
}

/// Copy of `payload` with every image replaced by a text placeholder.
pub fn strip_images(payload: &MessagePayload) -> MessagePayload {
    let mut stripped = payload.clone();
    for message in &mut stripped.messages {
        if message.images.is_empty() {
            continue;
        }
        let placeholders = vec![IMAGE_PLACEHOLDER; message.images.len()].join(" ");
        message.text = if message.text.trim().is_empty() {
            placeholders
        } else {
            format!("{} {}", message.text, placeholders)
        };
        message.images.clear();
    }
    stripped
}
