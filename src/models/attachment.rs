use serde::{Deserialize, Serialize};

/// A file riding along with one user turn. Text extraction happens before
/// it gets here; images are forwarded to the backend as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub body: AttachmentBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttachmentBody {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

impl Attachment {
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: AttachmentBody::Text(text.into()),
        }
    }

    pub fn image(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            body: AttachmentBody::Image {
                mime_type: mime_type.into(),
                data,
            },
        }
    }
}
