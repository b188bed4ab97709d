//! Import orchestrator.
//!
//! Mailboxes are opened and fetched one at a time by the dispatch loop, then
//! handed to a worker task. At most `max_concurrent_mailboxes` workers run at
//! once; the dispatch loop blocks on the permit before spawning. Every worker
//! owns its own store session and imports its messages in mailbox order.
//!
//! Failure boundaries:
//! - a failed message is logged with its diagnostic block and skipped
//! - a failed mailbox is reported and the remaining mailboxes continue

use crate::config::ImportConfig;
use crate::error::{ErrorPolicy, ImportError, MailboxError, SourceError};
use crate::import::envelope::{EnvelopeResolver, message_context};
use crate::import::part_tree::PartTreeBuilder;
use crate::import::stats::{ImportStats, MailboxReport, MailboxState, RunSummary};
use crate::mailbox::{MailPart, MailSource, PREFETCH_ITEMS};
use crate::store::{MailStore, StoreSession};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Settings that shape an import run.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub max_concurrent_mailboxes: usize,
    pub max_part_depth: usize,
    pub policy: ErrorPolicy,
}

impl From<&ImportConfig> for ImportOptions {
    fn from(config: &ImportConfig) -> Self {
        Self {
            max_concurrent_mailboxes: config.max_concurrent_mailboxes.max(1),
            max_part_depth: config.max_part_depth,
            policy: config.error_policy(),
        }
    }
}

enum Pending {
    Finished(MailboxReport),
    Running(String, JoinHandle<MailboxReport>),
}

pub struct Importer<M: MailSource, S: MailStore> {
    source: Arc<M>,
    store: Arc<S>,
    options: Arc<ImportOptions>,
}

impl<M: MailSource, S: MailStore> Importer<M, S> {
    pub fn new(source: M, store: S, options: ImportOptions) -> Self {
        Self {
            source: Arc::new(source),
            store: Arc::new(store),
            options: Arc::new(options),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Import every named mailbox and wait for all workers to finish.
    ///
    /// The summary holds one report per name, in input order.
    pub async fn run(&self, names: &[String]) -> RunSummary {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_mailboxes.max(1)));
        let mut pending = Vec::with_capacity(names.len());

        log::info!(
            "importing {} mailboxes with up to {} workers",
            names.len(),
            self.options.max_concurrent_mailboxes
        );

        for name in names {
            let messages = match self.open_and_fetch(name).await {
                Ok(messages) => messages,
                Err(err) => {
                    log::error!("### FAILED: {}: {}", name, err);
                    pending.push(Pending::Finished(MailboxReport::failed(name, err)));
                    continue;
                }
            };

            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    log::error!("### FAILED: {}: {}", name, err);
                    pending.push(Pending::Finished(MailboxReport::failed(name, err)));
                    continue;
                }
            };

            let worker = MailboxWorker {
                name: name.clone(),
                store: Arc::clone(&self.store),
                options: Arc::clone(&self.options),
            };
            let handle = tokio::spawn(async move {
                let _permit = permit;
                worker.import_messages(messages).await
            });
            pending.push(Pending::Running(name.clone(), handle));
        }

        let mut mailboxes = Vec::with_capacity(pending.len());
        for entry in pending {
            let report = match entry {
                Pending::Finished(report) => report,
                Pending::Running(name, handle) => match handle.await {
                    Ok(report) => report,
                    Err(err) => {
                        let err = MailboxError::Worker(err.to_string());
                        log::error!("### FAILED: {}: {}", name, err);
                        MailboxReport::failed(name, err)
                    }
                },
            };
            log::info!("{}", report);
            mailboxes.push(report);
        }

        RunSummary { mailboxes }
    }

    /// Open a folder and fetch its messages on the blocking pool.
    async fn open_and_fetch(&self, name: &str) -> Result<Vec<M::Message>, MailboxError> {
        let source = Arc::clone(&self.source);
        let name = name.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<M::Message>, MailboxError> {
            log::info!("{}: {}", name, MailboxState::Opening);
            let mut folder = source.open_folder(&name)?;
            if source.message_count(&folder) == 0 {
                return Err(SourceError::EmptyFolder(name).into());
            }

            log::info!("{}: {}", name, MailboxState::Fetching);
            let messages = source.list_messages(&mut folder)?;
            source.prefetch(&folder, &messages, PREFETCH_ITEMS);
            Ok(messages)
        })
        .await
        .map_err(|e| MailboxError::Worker(e.to_string()))?
    }
}

struct MailboxWorker<S: MailStore> {
    name: String,
    store: Arc<S>,
    options: Arc<ImportOptions>,
}

impl<S: MailStore> MailboxWorker<S> {
    async fn import_messages<P: MailPart>(self, messages: Vec<P>) -> MailboxReport {
        let mut session = match self.store.session().await {
            Ok(session) => session,
            Err(err) => {
                let err = MailboxError::Store(err);
                log::error!("### FAILED: {}: {}", self.name, err);
                return MailboxReport::failed(&self.name, err);
            }
        };

        log::info!(
            "{}: {} {} messages",
            self.name,
            MailboxState::Importing,
            messages.len()
        );

        let mut stats = ImportStats::default();
        for (nr, mut message) in messages.into_iter().enumerate() {
            let mut message_stats = ImportStats::default();
            match self
                .import_message(&mut session, &mut message, nr, &mut message_stats)
                .await
            {
                Ok(()) => {
                    message_stats.messages = 1;
                    stats.merge(message_stats);
                }
                Err(err) => {
                    // Rows written before the failure stay pending in the session.
                    stats.merge(message_stats);
                    stats.failed_messages += 1;
                    log::error!("{}: {}", self.name, err.diagnostic());
                }
            }
        }

        MailboxReport::done(&self.name, stats)
    }

    async fn import_message<P: MailPart>(
        &self,
        session: &mut S::Session,
        message: &mut P,
        nr: usize,
        stats: &mut ImportStats,
    ) -> Result<(), ImportError> {
        let resolver = EnvelopeResolver::new(&self.options.policy);

        let envelope = resolver
            .import_envelope(session, &*message, Some(nr), false, stats)
            .await?
            .ok_or_else(|| ImportError::NoEnvelope {
                context: Box::new(message_context(&*message, Some(nr), false)),
            })?;

        let mut context = message_context(&*message, Some(nr), false);
        context.db_key = Some(envelope.id);

        let builder = PartTreeBuilder::new(resolver, self.options.max_part_depth);
        let mut tree = builder
            .build_message(session, &context, message, stats)
            .await?;
        builder
            .persist(session, envelope.id, &mut tree, stats)
            .await
            .map_err(|e| ImportError::store(&context, e))?;

        session
            .commit()
            .await
            .map_err(|e| ImportError::store(&context, e))?;

        log::debug!(
            "{}: message {} stored as envelope {} with {} parts",
            self.name,
            nr,
            envelope.id,
            tree.node_count()
        );
        Ok(())
    }
}
