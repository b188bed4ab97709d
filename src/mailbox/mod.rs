//! Mailbox source collaborator.
//!
//! The import pipeline only sees two abstractions:
//!
//! - **[`MailSource`]**: opens a named folder, lists its messages in order and
//!   accepts a best-effort metadata prefetch hint.
//! - **[`MailPart`]**: one message or body part, exposing headers, the declared
//!   content type and its decoded content.
//!
//! [`MboxSource`] and [`MimePart`] are the file-backed implementations built
//! on `mailparse`.

pub mod mbox;
pub mod mime;

use crate::error::{ContentError, SourceError};
use std::path::Path;

pub use mbox::MboxSource;
pub use mime::MimePart;

/// Content object of a part, as decoded by the MIME layer.
#[derive(Debug)]
pub enum Content<'a, P> {
    /// Charset-decoded text.
    Text(String),
    /// Transfer-decoded bytes of a non-text part.
    Bytes(Vec<u8>),
    /// Ordered children of a `multipart/*` container.
    Multipart(&'a mut [P]),
    /// The full message carried by a `message/rfc822` part.
    Message(&'a mut P),
}

/// A message or a body part of a message.
pub trait MailPart: Send + Sync + Sized {
    /// First value of a header, case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    /// All values of a header in document order.
    fn header_values(&self, name: &str) -> Vec<&str>;

    /// Declared `Content-Type` header value.
    fn content_type(&self) -> &str;

    /// Replace the declared content type; affects later [`MailPart::content`] calls.
    fn set_content_type(&mut self, value: String);

    fn file_name(&self) -> Option<&str>;

    /// True when this object is a full message rather than a body part.
    fn is_message(&self) -> bool;

    fn content(&mut self) -> Result<Content<'_, Self>, ContentError>;

    /// Match the base MIME type against `type/subtype` or `type/*`.
    fn is_mime_type(&self, pattern: &str) -> bool {
        mime_type_matches(self.content_type(), pattern)
    }
}

/// Lowercased `type/subtype` of a content type header value.
pub fn base_mime_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn mime_type_matches(content_type: &str, pattern: &str) -> bool {
    let base = base_mime_type(content_type);
    let pattern = pattern.trim().to_ascii_lowercase();

    match pattern.strip_suffix("/*") {
        Some(primary) => base
            .split_once('/')
            .map(|(kind, _)| kind == primary)
            .unwrap_or(false),
        None => base == pattern,
    }
}

/// Metadata a source may prefetch in bulk before the import phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItem {
    Envelope,
    Flags,
    Header(&'static str),
}

/// Items prefetched for every mailbox.
pub const PREFETCH_ITEMS: &[FetchItem] = &[
    FetchItem::Envelope,
    FetchItem::Flags,
    FetchItem::Header("X-Mailer"),
];

/// Access to a store of mail folders.
pub trait MailSource: Send + Sync + 'static {
    type Folder: Send + 'static;
    type Message: MailPart + 'static;

    fn open_folder(&self, name: &str) -> Result<Self::Folder, SourceError>;

    fn message_count(&self, folder: &Self::Folder) -> usize;

    /// Messages of the folder in store order.
    fn list_messages(&self, folder: &mut Self::Folder) -> Result<Vec<Self::Message>, SourceError>;

    /// Bulk metadata prefetch. A hint only; implementations may ignore it.
    fn prefetch(&self, _folder: &Self::Folder, _messages: &[Self::Message], _items: &[FetchItem]) {}
}

/// Mailbox names from a list file: one per line, blank lines and `#`
/// comments skipped.
pub fn parse_mailbox_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn read_mailbox_list(path: &Path) -> Result<Vec<String>, SourceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SourceError::io(path, e))?;
    Ok(parse_mailbox_list(&raw))
}
