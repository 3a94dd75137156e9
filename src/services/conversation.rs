use crate::models::{Attachment, AttachmentBody, Message};
use crate::providers::{ChatMessage, ImageAttachment};

pub const DEFAULT_TITLE_CHARS: usize = 60;

/// Truncate text to a short title for conversations.
pub fn truncate_title(text: &str, max_chars: usize) -> String {
    let first_line = text.trim().lines().next().unwrap_or("").trim();
    if first_line.chars().count() > max_chars {
        let kept: String = first_line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept.trim_end())
    } else {
        first_line.to_string()
    }
}

/// Convert stored history into the backend's message list.
pub fn messages_to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
            images: Vec::new(),
        })
        .collect()
}

/// The user message as sent and stored. Text attachments are inlined;
/// images travel separately and are not persisted.
pub fn compose_user_message(user_text: &str, attachment: Option<&Attachment>) -> ChatMessage {
    let mut message = ChatMessage::user(user_text);

    if let Some(attachment) = attachment {
        match &attachment.body {
            AttachmentBody::Text(text) => {
                message.content = format!(
                    "{}\n\n[Attached file: {}]\n{}",
                    user_text, attachment.name, text
                );
            }
            AttachmentBody::Image { mime_type, data } => {
                message.images.push(ImageAttachment {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                });
            }
        }
    }

    message
}
