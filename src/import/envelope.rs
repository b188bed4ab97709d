//! Envelope resolver: turn a message's headers into an envelope row plus its
//! subscriber associations.
//!
//! Direct imports must be new: a conflict on the `Message-ID` of a top-level
//! message is a fatal duplicate. Embedded (referenced) messages may already
//! exist and are then adopted by `Message-ID` lookup.

use crate::error::{ErrorPolicy, ImportError, MessageContext};
use crate::import::address::{AddressRegistry, parse_address_headers};
use crate::import::stats::ImportStats;
use crate::mailbox::MailPart;
use crate::models::{Envelope, EnvelopeFields, Role};
use crate::store::{EnvelopeInsert, StoreSession};
use chrono::{DateTime, Utc};

/// Header read order; association rows follow the same order.
const ROLES: [Role; 4] = [Role::From, Role::ReplyTo, Role::To, Role::Cc];

fn header_text<P: MailPart>(message: &P, name: &str) -> Option<String> {
    message
        .header(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_send_date(raw: &str) -> Option<DateTime<Utc>> {
    match dateparser::parse(raw) {
        Ok(date) => Some(date.with_timezone(&Utc)),
        Err(err) => {
            log::debug!("unparseable Date header '{}': {}", raw, err);
            None
        }
    }
}

/// Header-derived envelope columns of a message.
pub fn envelope_fields<P: MailPart>(message: &P) -> EnvelopeFields {
    EnvelopeFields {
        message_id: header_text(message, "Message-ID"),
        subject: header_text(message, "Subject"),
        send_date: header_text(message, "Date").and_then(|raw| parse_send_date(&raw)),
        x_mailer: header_text(message, "X-Mailer"),
        user_agent: header_text(message, "User-Agent"),
    }
}

/// Diagnostic context for a message that has not been stored yet.
pub fn message_context<P: MailPart>(message: &P, nr: Option<usize>, referenced: bool) -> MessageContext {
    MessageContext {
        nr,
        message_id: header_text(message, "Message-ID"),
        db_key: None,
        referenced,
        subject: header_text(message, "Subject"),
        x_mailer: header_text(message, "X-Mailer"),
    }
}

#[derive(Clone, Copy)]
pub struct EnvelopeResolver<'a> {
    policy: &'a ErrorPolicy,
}

impl<'a> EnvelopeResolver<'a> {
    pub fn new(policy: &'a ErrorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &'a ErrorPolicy {
        self.policy
    }

    /// Store the envelope of `message` and associate its subscribers.
    ///
    /// Returns `Ok(None)` when no envelope key could be established (the
    /// insert hit an ignorable conflict and no existing row was found).
    pub async fn import_envelope<S, P>(
        &self,
        session: &mut S,
        message: &P,
        nr: Option<usize>,
        referenced: bool,
        stats: &mut ImportStats,
    ) -> Result<Option<Envelope>, ImportError>
    where
        S: StoreSession,
        P: MailPart,
    {
        let mut context = message_context(message, nr, referenced);
        let fields = envelope_fields(message);
        let registry = AddressRegistry::new(self.policy);

        let mut envelope = Envelope {
            id: 0,
            fields,
            from_ids: Vec::new(),
            to_ids: Vec::new(),
            cc_ids: Vec::new(),
            reply_to_ids: Vec::new(),
            referenced,
        };

        for role in ROLES {
            let addresses = parse_address_headers(&message.header_values(role.header()));
            if addresses.is_empty() {
                continue;
            }
            stats.addresses += addresses.len();
            let ids = registry
                .resolve(session, &addresses)
                .await
                .map_err(|e| ImportError::store(&context, e))?;
            match role {
                Role::From => envelope.from_ids = ids,
                Role::ReplyTo => envelope.reply_to_ids = ids,
                Role::To => envelope.to_ids = ids,
                Role::Cc => envelope.cc_ids = ids,
            }
        }

        let inserted = session
            .insert_or_get_envelope(self.policy, &envelope.fields, referenced)
            .await
            .map_err(|e| ImportError::store(&context, e))?;

        envelope.id = match inserted {
            EnvelopeInsert::Inserted(id) => id,
            EnvelopeInsert::Reused(id) => {
                log::debug!(
                    "reusing envelope {} for {}",
                    id,
                    envelope.fields.message_id.as_deref().unwrap_or("<EMPTY>")
                );
                stats.reused_envelopes += 1;
                id
            }
            EnvelopeInsert::Conflict(source) => {
                return Err(ImportError::DuplicateEnvelope {
                    context: Box::new(context),
                    source,
                });
            }
            EnvelopeInsert::Missing => {
                log::warn!(
                    "envelope {} conflicted but was not found",
                    envelope.fields.message_id.as_deref().unwrap_or("<EMPTY>")
                );
                return Ok(None);
            }
        };
        context.db_key = Some(envelope.id);

        for role in ROLES {
            for &subscriber_id in envelope.subscriber_ids(role) {
                let result = session
                    .insert_envelope_subscriber(envelope.id, subscriber_id, role)
                    .await;
                if self
                    .policy
                    .check(result)
                    .map_err(|e| ImportError::store(&context, e))?
                    .is_none()
                {
                    log::warn!(
                        "association {} of subscriber {} to envelope {} skipped",
                        role,
                        subscriber_id,
                        envelope.id
                    );
                }
            }
        }

        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UNIQUE_VIOLATION;
    use crate::mailbox::MimePart;
    use crate::store::{MailStore, MemoryStore};
    use chrono::TimeZone;

    const MESSAGE: &str = concat!(
        "From: Alice <alice@example.com>\r\n",
        "To: bob@example.com, carol@example.com\r\n",
        "Cc: Alice <alice@example.com>\r\n",
        "Subject: Hello\r\n",
        "Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n",
        "Message-ID: <hello@example.com>\r\n",
        "X-Mailer: mutt\r\n",
        "\r\n",
        "body\r\n",
    );

    fn policy() -> ErrorPolicy {
        ErrorPolicy::new([UNIQUE_VIOLATION])
    }

    #[test]
    fn test_envelope_fields() {
        let message = MimePart::parse(MESSAGE.as_bytes());
        let fields = envelope_fields(&message);
        assert_eq!(fields.message_id.as_deref(), Some("<hello@example.com>"));
        assert_eq!(fields.subject.as_deref(), Some("Hello"));
        assert_eq!(fields.x_mailer.as_deref(), Some("mutt"));
        assert_eq!(fields.user_agent, None);
        assert_eq!(
            fields.send_date,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_missing_headers_are_absent() {
        let message = MimePart::parse(b"Message-ID:  \r\nDate: someday\r\n\r\nbody\r\n");
        let fields = envelope_fields(&message);
        assert_eq!(fields.message_id, None);
        assert_eq!(fields.send_date, None);
    }

    #[tokio::test]
    async fn test_import_envelope_with_associations() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let message = MimePart::parse(MESSAGE.as_bytes());
        let policy = policy();
        let resolver = EnvelopeResolver::new(&policy);
        let mut stats = ImportStats::default();

        let envelope = resolver
            .import_envelope(&mut session, &message, Some(0), false, &mut stats)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(envelope.from_ids, vec![1]);
        assert_eq!(envelope.to_ids, vec![2, 3]);
        assert_eq!(envelope.cc_ids, vec![1]);
        assert_eq!(stats.addresses, 4);
        assert_eq!(store.subscribers().len(), 3);

        let rows = store.envelope_subscribers();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].role, Role::From);
        assert_eq!(rows[3].role, Role::Cc);
    }

    #[tokio::test]
    async fn test_direct_duplicate_is_fatal() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let message = MimePart::parse(MESSAGE.as_bytes());
        let policy = policy();
        let resolver = EnvelopeResolver::new(&policy);
        let mut stats = ImportStats::default();

        resolver
            .import_envelope(&mut session, &message, Some(0), false, &mut stats)
            .await
            .unwrap();
        let err = resolver
            .import_envelope(&mut session, &message, Some(1), false, &mut stats)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::DuplicateEnvelope { .. }));
        assert_eq!(err.context().nr, Some(1));
    }

    #[tokio::test]
    async fn test_referenced_duplicate_is_reused() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let message = MimePart::parse(MESSAGE.as_bytes());
        let policy = policy();
        let resolver = EnvelopeResolver::new(&policy);
        let mut stats = ImportStats::default();

        let first = resolver
            .import_envelope(&mut session, &message, Some(0), false, &mut stats)
            .await
            .unwrap()
            .unwrap();
        let second = resolver
            .import_envelope(&mut session, &message, None, true, &mut stats)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(stats.reused_envelopes, 1);
        assert_eq!(store.envelopes().len(), 1);
    }

    #[tokio::test]
    async fn test_ignorable_association_conflict_is_skipped() {
        let store = MemoryStore::new();
        store.conflict_associations_for("carol@example.com");
        let mut session = store.session().await.unwrap();
        let message = MimePart::parse(MESSAGE.as_bytes());
        let policy = policy();
        let resolver = EnvelopeResolver::new(&policy);
        let mut stats = ImportStats::default();

        let envelope = resolver
            .import_envelope(&mut session, &message, Some(0), false, &mut stats)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.to_ids, vec![2, 3]);

        let rows: Vec<(i64, Role)> = store
            .envelope_subscribers()
            .into_iter()
            .map(|row| (row.subscriber_id, row.role))
            .collect();
        assert_eq!(rows, vec![(1, Role::From), (2, Role::To), (1, Role::Cc)]);
    }

    #[tokio::test]
    async fn test_fatal_subscriber_error_stops_the_envelope() {
        let store = MemoryStore::new();
        store.fail_subscriber("bob@example.com");
        let mut session = store.session().await.unwrap();
        let message = MimePart::parse(MESSAGE.as_bytes());
        let policy = policy();
        let resolver = EnvelopeResolver::new(&policy);
        let mut stats = ImportStats::default();

        let err = resolver
            .import_envelope(&mut session, &message, Some(7), false, &mut stats)
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            ImportError::Store { source, .. } if source.code.as_deref() == Some("XX000")
        ));
        assert_eq!(err.context().nr, Some(7));
        assert!(store.envelopes().is_empty());
        assert!(store.envelope_subscribers().is_empty());
        assert_eq!(store.subscribers().len(), 1);
    }
}
