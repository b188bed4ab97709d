//! Owned MIME tree built on `mailparse`.
//!
//! `mailparse` borrows from the raw message and decodes the charset eagerly.
//! The import pipeline needs to rewrite a part's declared content type before
//! its content is read, so [`MimePart`] keeps the transfer-decoded bytes and
//! defers charset decoding (via `encoding_rs` labels) to [`MailPart::content`].

use crate::error::ContentError;
use crate::mailbox::{Content, MailPart, base_mime_type};
use encoding_rs::Encoding;
use mailparse::{MailHeaderMap, ParsedMail, parse_content_type, parse_mail};

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=us-ascii";

#[derive(Debug, Clone)]
enum Body {
    Data(Vec<u8>),
    Multipart(Vec<MimePart>),
    Message(Box<MimePart>),
    Malformed(ContentError),
}

/// A parsed message or body part.
#[derive(Debug, Clone)]
pub struct MimePart {
    headers: Vec<(String, String)>,
    content_type: String,
    file_name: Option<String>,
    body: Body,
    message: bool,
}

impl MimePart {
    /// Parse a full RFC 5322 message.
    ///
    /// Never fails: a message whose headers cannot be parsed yields a part
    /// without headers whose content reports [`ContentError::Header`].
    pub fn parse(raw: &[u8]) -> Self {
        match parse_mail(raw) {
            Ok(parsed) => Self::from_parsed(&parsed, true),
            Err(err) => {
                log::debug!("unparseable message headers: {}", err);
                Self {
                    headers: Vec::new(),
                    content_type: DEFAULT_CONTENT_TYPE.to_string(),
                    file_name: None,
                    body: Body::Malformed(ContentError::Header(err.to_string())),
                    message: true,
                }
            }
        }
    }

    fn from_parsed(parsed: &ParsedMail<'_>, message: bool) -> Self {
        let headers = parsed
            .headers
            .iter()
            .map(|header| (header.get_key(), header.get_value()))
            .collect();

        let content_type = parsed
            .headers
            .get_first_value("Content-Type")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let disposition = parsed.get_content_disposition();
        let file_name = disposition
            .params
            .get("filename")
            .or_else(|| parsed.ctype.params.get("name"))
            .cloned();

        let body = if parsed.ctype.mimetype.starts_with("multipart/") {
            Body::Multipart(
                parsed
                    .subparts
                    .iter()
                    .map(|sub| Self::from_parsed(sub, false))
                    .collect(),
            )
        } else if parsed.ctype.mimetype == "message/rfc822" {
            match parsed.get_body_raw() {
                Ok(raw) => match parse_mail(&raw) {
                    Ok(nested) => Body::Message(Box::new(Self::from_parsed(&nested, true))),
                    Err(err) => Body::Malformed(ContentError::Header(err.to_string())),
                },
                Err(err) => Body::Malformed(ContentError::Malformed(err.to_string())),
            }
        } else {
            match parsed.get_body_raw() {
                Ok(raw) => Body::Data(raw),
                Err(err) => Body::Malformed(ContentError::Malformed(err.to_string())),
            }
        };

        Self {
            headers,
            content_type,
            file_name,
            body,
            message,
        }
    }

    fn charset(&self) -> String {
        parse_content_type(&self.content_type).charset
    }
}

impl MailPart for MimePart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn set_content_type(&mut self, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case("Content-Type"))
        {
            Some((_, header)) => *header = value.clone(),
            None => self.headers.push(("Content-Type".to_string(), value.clone())),
        }
        self.content_type = value;
    }

    fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    fn is_message(&self) -> bool {
        self.message
    }

    fn content(&mut self) -> Result<Content<'_, Self>, ContentError> {
        let is_text = base_mime_type(&self.content_type).starts_with("text/");
        let charset = self.charset();

        match &mut self.body {
            Body::Malformed(err) => Err(err.clone()),
            Body::Multipart(children) => Ok(Content::Multipart(children.as_mut_slice())),
            Body::Message(inner) => Ok(Content::Message(inner.as_mut())),
            Body::Data(bytes) if is_text => {
                let encoding = Encoding::for_label(charset.as_bytes())
                    .ok_or_else(|| ContentError::UnsupportedCharset(charset.clone()))?;
                let (text, _, _) = encoding.decode(bytes.as_slice());
                Ok(Content::Text(text.into_owned()))
            }
            Body::Data(bytes) => Ok(Content::Bytes(bytes.clone())),
        }
    }
}
