pub mod attachment;
pub mod conversation;
pub mod draft;
pub mod message;

pub use attachment::{Attachment, AttachmentBody};
pub use conversation::Conversation;
pub use draft::Draft;
pub use message::{AppendReceipt, Message, Role};
