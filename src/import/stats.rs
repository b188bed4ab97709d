//! Import statistics and run reporting.

use std::fmt;

/// Counters for the messages of one mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Top-level messages imported and committed
    pub messages: usize,
    /// Top-level messages that failed and were skipped
    pub failed_messages: usize,
    /// Addresses parsed from From, Reply-To, To and Cc headers
    pub addresses: usize,
    /// Embedded messages stored as referenced envelopes
    pub referenced_envelopes: usize,
    /// Referenced envelopes adopted from an earlier import
    pub reused_envelopes: usize,
    /// Part rows written
    pub parts: usize,
}

impl ImportStats {
    /// Merge another ImportStats into this one by summing all counts.
    pub fn merge(&mut self, other: ImportStats) {
        self.messages += other.messages;
        self.failed_messages += other.failed_messages;
        self.addresses += other.addresses;
        self.referenced_envelopes += other.referenced_envelopes;
        self.reused_envelopes += other.reused_envelopes;
        self.parts += other.parts;
    }
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} messages, {} failed, {} addresses, {} referenced ({} reused), {} parts",
            self.messages,
            self.failed_messages,
            self.addresses,
            self.referenced_envelopes,
            self.reused_envelopes,
            self.parts
        )
    }
}

/// Lifecycle of one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    Opening,
    Fetching,
    Importing,
    Done,
    Failed,
}

impl fmt::Display for MailboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MailboxState::Opening => "opening",
            MailboxState::Fetching => "fetching",
            MailboxState::Importing => "importing",
            MailboxState::Done => "done",
            MailboxState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Final state of one mailbox.
#[derive(Debug, Clone)]
pub struct MailboxReport {
    pub name: String,
    pub state: MailboxState,
    pub stats: ImportStats,
    pub error: Option<String>,
}

impl MailboxReport {
    pub fn done(name: impl Into<String>, stats: ImportStats) -> Self {
        Self {
            name: name.into(),
            state: MailboxState::Done,
            stats,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            state: MailboxState::Failed,
            stats: ImportStats::default(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == MailboxState::Failed
    }
}

impl fmt::Display for MailboxReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{}: {} ({})", self.name, self.state, error),
            None => write!(f, "{}: {} ({})", self.name, self.state, self.stats),
        }
    }
}

/// Outcome of a whole run, one report per requested mailbox in input order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub mailboxes: Vec<MailboxReport>,
}

impl RunSummary {
    pub fn totals(&self) -> ImportStats {
        let mut totals = ImportStats::default();
        for report in &self.mailboxes {
            totals.merge(report.stats.clone());
        }
        totals
    }

    pub fn failed_mailboxes(&self) -> usize {
        self.mailboxes.iter().filter(|report| report.is_failed()).count()
    }

    pub fn report(&self, name: &str) -> Option<&MailboxReport> {
        self.mailboxes.iter().find(|report| report.name == name)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Import summary:")?;
        for report in &self.mailboxes {
            writeln!(f, "  {}", report)?;
        }
        write!(
            f,
            "  total: {} mailboxes ({} failed), {}",
            self.mailboxes.len(),
            self.failed_mailboxes(),
            self.totals()
        )
    }
}
