//! Error taxonomy for the import pipeline.
//!
//! Errors are terminated at the nearest recovery boundary:
//!
//! - [`ContentError`]: swallowed per part, content is omitted
//! - [`ImportError`]: caught per message by the orchestrator
//! - [`MailboxError`]: caught per mailbox by the orchestrator
//!
//! Store failures carry the store-reported code so that the operator-supplied
//! [`ErrorPolicy`] can decide whether a failure is an expected duplicate-key
//! condition or a fatal one.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Width of the label column in the diagnostic block.
const COLUMN_WIDTH: usize = 20;
const BORDER: &str = "########################################";

/// A failure reported by the persistence collaborator.
#[derive(Debug, Clone)]
pub struct StoreError {
    /// Store-specific error code (SQLSTATE for Postgres).
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "store error [{}]: {}", code, self.message),
            None => write!(f, "store error: {}", self.message),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => Self {
                code: db_err.code().map(|code| code.into_owned()),
                message: db_err.message().to_string(),
            },
            _ => Self::uncoded(err.to_string()),
        }
    }
}

/// Operator-configured classification of store error codes.
///
/// Codes in the set are expected duplicate-key conditions (handled by
/// lookup-and-reuse); anything else is fatal and propagates.
#[derive(Debug, Clone, Default)]
pub struct ErrorPolicy {
    ignorable: BTreeSet<String>,
}

impl ErrorPolicy {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignorable: codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_ignorable(&self, err: &StoreError) -> bool {
        err.code
            .as_ref()
            .map(|code| self.ignorable.contains(code))
            .unwrap_or(false)
    }

    /// Map an ignorable failure to `Ok(None)` and keep fatal ones as errors.
    pub fn check<T>(&self, result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.is_ignorable(&err) => {
                log::debug!("ignoring store error: {}", err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.ignorable.iter().map(String::as_str)
    }
}

/// Failure to access a mailbox.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("mailbox not found: {0}")]
    NotFound(PathBuf),
    #[error("empty mailbox folder: {0}")]
    EmptyFolder(String),
}

impl SourceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SourceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure to retrieve the content of a single part. Never fatal.
#[derive(Debug, Clone, Error)]
pub enum ContentError {
    #[error("malformed MIME header: {0}")]
    Header(String),
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
    #[error("malformed content: {0}")]
    Malformed(String),
}

/// Diagnostic context of the top-level message being imported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub nr: Option<usize>,
    pub message_id: Option<String>,
    pub db_key: Option<i64>,
    pub referenced: bool,
    pub subject: Option<String>,
    pub x_mailer: Option<String>,
}

impl MessageContext {
    fn write_value(f: &mut fmt::Formatter<'_>, key: &str, value: Option<String>) -> fmt::Result {
        let value = value.unwrap_or_else(|| "<EMPTY>".to_string());
        writeln!(f, "{:<width$}{}", key, value, width = COLUMN_WIDTH)
    }
}

impl fmt::Display for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "### Message Info #######################")?;
        Self::write_value(f, "Nr: ", self.nr.map(|nr| nr.to_string()))?;
        Self::write_value(f, "MessageID: ", self.message_id.clone())?;
        Self::write_value(f, "DBKey: ", self.db_key.map(|key| key.to_string()))?;
        Self::write_value(f, "Referenced: ", Some(self.referenced.to_string()))?;
        Self::write_value(f, "Subject: ", self.subject.clone())?;
        Self::write_value(f, "X-Mailer: ", self.x_mailer.clone())
    }
}

/// Message-level failure, enriched with the owning message's context.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("message import failed: {source}")]
    Store {
        context: Box<MessageContext>,
        #[source]
        source: StoreError,
    },
    #[error("envelope already imported: {}", .context.message_id.as_deref().unwrap_or("<EMPTY>"))]
    DuplicateEnvelope {
        context: Box<MessageContext>,
        #[source]
        source: StoreError,
    },
    #[error("no envelope key could be established")]
    NoEnvelope { context: Box<MessageContext> },
}

impl ImportError {
    pub fn store(context: &MessageContext, source: StoreError) -> Self {
        ImportError::Store {
            context: Box::new(context.clone()),
            source,
        }
    }

    pub fn context(&self) -> &MessageContext {
        match self {
            ImportError::Store { context, .. }
            | ImportError::DuplicateEnvelope { context, .. }
            | ImportError::NoEnvelope { context } => context,
        }
    }

    /// Re-home the error onto the top-level message that owns the failing part.
    pub fn with_context(self, owner: &MessageContext) -> Self {
        let owner = Box::new(owner.clone());
        match self {
            ImportError::Store { source, .. } => ImportError::Store {
                context: owner,
                source,
            },
            ImportError::DuplicateEnvelope { source, .. } => ImportError::DuplicateEnvelope {
                context: owner,
                source,
            },
            ImportError::NoEnvelope { .. } => ImportError::NoEnvelope { context: owner },
        }
    }

    /// Bordered diagnostic block emitted for every failed message.
    pub fn diagnostic(&self) -> String {
        let mut block = String::new();
        block.push('\n');
        block.push_str(BORDER);
        block.push('\n');
        block.push_str(&self.to_string());
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            block.push_str(&format!("\ncaused by: {}", cause));
            source = cause.source();
        }
        block.push('\n');
        block.push_str(&self.context().to_string());
        block.push_str(BORDER);
        block
    }
}

/// Failure before any mailbox is imported: configuration, connection or
/// schema setup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("database setup failed: {0}")]
    Store(#[from] StoreError),
    #[error("failed to read mailbox list: {0}")]
    MailboxList(#[from] SourceError),
}

/// Whole-mailbox failure.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox source error: {0}")]
    Source(#[from] SourceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("mailbox worker failed: {0}")]
    Worker(String),
}
