//! File-backed mailbox source.
//!
//! A mailbox name resolves to an mbox file below the configured mail root.
//! Files are split on `From ` separator lines that start the file or follow a
//! blank line; `>From ` escapes are undone one level (mboxrd). A file that
//! does not start with a separator is treated as a single message.

use crate::error::SourceError;
use crate::mailbox::{FetchItem, MailSource, MimePart};
use std::path::{Path, PathBuf};

/// An opened mbox file with its raw, split messages.
#[derive(Debug)]
pub struct MboxFolder {
    name: String,
    path: PathBuf,
    messages: Vec<Vec<u8>>,
}

impl MboxFolder {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone)]
pub struct MboxSource {
    root: PathBuf,
}

impl MboxSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }
}

impl MailSource for MboxSource {
    type Folder = MboxFolder;
    type Message = MimePart;

    fn open_folder(&self, name: &str) -> Result<MboxFolder, SourceError> {
        let path = self.resolve(name);
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound(path.clone())
            } else {
                SourceError::io(&path, e)
            }
        })?;

        let messages = split_mbox(&data);
        log::debug!("{}: {} messages in {}", name, messages.len(), path.display());

        Ok(MboxFolder {
            name: name.to_string(),
            path,
            messages,
        })
    }

    fn message_count(&self, folder: &MboxFolder) -> usize {
        folder.messages.len()
    }

    fn list_messages(&self, folder: &mut MboxFolder) -> Result<Vec<MimePart>, SourceError> {
        Ok(std::mem::take(&mut folder.messages)
            .into_iter()
            .map(|raw| MimePart::parse(&raw))
            .collect())
    }

    fn prefetch(&self, folder: &MboxFolder, messages: &[MimePart], items: &[FetchItem]) {
        // Everything is already in memory once the file has been split.
        log::debug!(
            "{}: prefetch of {:?} for {} messages is a no-op",
            folder.name,
            items,
            messages.len()
        );
    }
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\n" || line == b"\r\n"
}

fn unescape_from(line: &[u8]) -> &[u8] {
    let quoted = line.iter().take_while(|&&b| b == b'>').count();
    if quoted > 0 && line[quoted..].starts_with(b"From ") {
        &line[1..]
    } else {
        line
    }
}

/// Drop the blank line that precedes the next separator.
fn finish_message(mut message: Vec<u8>) -> Vec<u8> {
    if message.ends_with(b"\r\n\r\n") {
        message.truncate(message.len() - 2);
    } else if message.ends_with(b"\n\n") {
        message.truncate(message.len() - 1);
    }
    message
}

/// Split raw mbox data into individual messages, in file order.
pub fn split_mbox(data: &[u8]) -> Vec<Vec<u8>> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);

    let mut messages = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut previous_blank = true;

    for line in data.split_inclusive(|&b| b == b'\n') {
        if previous_blank && line.starts_with(b"From ") {
            if let Some(message) = current.take() {
                messages.push(finish_message(message));
            }
            current = Some(Vec::new());
            previous_blank = false;
            continue;
        }

        let blank = is_blank(line);
        match current.as_mut() {
            Some(message) => message.extend_from_slice(unescape_from(line)),
            None if !blank => current = Some(unescape_from(line).to_vec()),
            None => {}
        }
        previous_blank = blank;
    }

    if let Some(message) = current {
        messages.push(finish_message(message));
    }

    messages.retain(|message| message.iter().any(|b| !b.is_ascii_whitespace()));
    messages
}
