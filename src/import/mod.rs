//! Import pipeline.
//!
//! - [`address`]: parse address headers into deduplicated subscriber keys
//! - [`envelope`]: store a message's envelope and subscriber associations
//! - [`part_tree`]: capture and persist the MIME part tree
//! - [`orchestrator`]: bounded-concurrency fan-out over mailboxes
//! - [`stats`]: counters and run reports

pub mod address;
pub mod envelope;
pub mod orchestrator;
pub mod part_tree;
pub mod stats;

pub use orchestrator::{ImportOptions, Importer};
pub use stats::{ImportStats, MailboxReport, MailboxState, RunSummary};
