//! Part tree builder: walk a message's MIME structure depth-first, capture
//! each part's metadata and content, then persist the tree with parent links.
//!
//! Embedded messages found during the walk are stored as referenced envelopes
//! and linked from their part via `referenced_envelope_id`.

use crate::error::{ErrorPolicy, ImportError, MessageContext, StoreError};
use crate::import::envelope::EnvelopeResolver;
use crate::import::stats::ImportStats;
use crate::mailbox::{Content, MailPart};
use crate::models::PartNode;
use crate::store::StoreSession;
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const UTF7: &str = "utf-7";

/// Replace a declared UTF-7 charset with UTF-8, keeping the rest intact.
pub fn rewrite_utf7(content_type: &str) -> Option<String> {
    let start = content_type.to_ascii_lowercase().find(UTF7)?;
    let mut rewritten = String::with_capacity(content_type.len());
    rewritten.push_str(&content_type[..start]);
    rewritten.push_str("UTF-8");
    rewritten.push_str(&content_type[start + UTF7.len()..]);
    Some(rewritten)
}

pub struct PartTreeBuilder<'a> {
    resolver: EnvelopeResolver<'a>,
    max_depth: usize,
}

impl<'a> PartTreeBuilder<'a> {
    pub fn new(resolver: EnvelopeResolver<'a>, max_depth: usize) -> Self {
        Self {
            resolver,
            max_depth,
        }
    }

    fn policy(&self) -> &'a ErrorPolicy {
        self.resolver.policy()
    }

    /// Build the part tree of a top-level message whose envelope already exists.
    pub async fn build_message<S, P>(
        &self,
        session: &mut S,
        owner: &MessageContext,
        message: &mut P,
        stats: &mut ImportStats,
    ) -> Result<PartNode, ImportError>
    where
        S: StoreSession,
        P: MailPart,
    {
        self.build(session, owner, message, 0, stats).await
    }

    fn build<'s, S, P>(
        &'s self,
        session: &'s mut S,
        owner: &'s MessageContext,
        part: &'s mut P,
        depth: usize,
        stats: &'s mut ImportStats,
    ) -> BoxFuture<'s, Result<PartNode, ImportError>>
    where
        S: StoreSession,
        P: MailPart,
    {
        Box::pin(async move {
            let mut node = PartNode::default();

            if depth > 0 && part.is_message() {
                let referenced = self
                    .resolver
                    .import_envelope(session, &*part, None, true, stats)
                    .await
                    .map_err(|e| e.with_context(owner))?;
                if let Some(envelope) = referenced {
                    stats.referenced_envelopes += 1;
                    node.fields.referenced_envelope_id = Some(envelope.id);
                }
            }

            let mut content_type = part.content_type().to_string();
            if let Some(rewritten) = rewrite_utf7(&content_type) {
                log::debug!("rewriting content type '{}' to '{}'", content_type, rewritten);
                part.set_content_type(rewritten.clone());
                content_type = rewritten;
            }
            node.fields.content_type = Some(content_type);
            node.fields.file_name = part.file_name().map(str::to_string);

            let is_multipart = part.is_mime_type("multipart/*");
            let is_embedded = part.is_mime_type("message/rfc822");
            let descend = depth < self.max_depth;

            match part.content() {
                Err(err) => {
                    log::debug!(
                        "content of part in {} unavailable: {}",
                        owner.message_id.as_deref().unwrap_or("<EMPTY>"),
                        err
                    );
                }
                Ok(Content::Text(text)) => {
                    node.fields.raw_content = Some(text.clone().into_bytes());
                    node.fields.decoded_content = Some(text);
                }
                Ok(Content::Bytes(bytes)) => {
                    node.fields.raw_content = Some(bytes);
                }
                Ok(Content::Multipart(children)) if is_multipart => {
                    if descend {
                        for child in children.iter_mut() {
                            let child_node = self
                                .build(&mut *session, owner, child, depth + 1, &mut *stats)
                                .await?;
                            node.children.push(child_node);
                        }
                    } else {
                        self.warn_truncated(owner, depth);
                    }
                }
                Ok(Content::Message(inner)) if is_embedded => {
                    if descend {
                        let child_node = self
                            .build(&mut *session, owner, inner, depth + 1, &mut *stats)
                            .await?;
                        node.children.push(child_node);
                    } else {
                        self.warn_truncated(owner, depth);
                    }
                }
                Ok(_) => {
                    log::debug!("part content does not match declared type, skipped");
                }
            }

            Ok(node)
        })
    }

    fn warn_truncated(&self, owner: &MessageContext, depth: usize) {
        log::warn!(
            "part tree of {} truncated at depth {}",
            owner.message_id.as_deref().unwrap_or("<EMPTY>"),
            depth
        );
    }

    /// Persist a built tree for `envelope_id`. The root hangs off the envelope.
    pub async fn persist<S: StoreSession>(
        &self,
        session: &mut S,
        envelope_id: i64,
        root: &mut PartNode,
        stats: &mut ImportStats,
    ) -> Result<(), StoreError> {
        self.persist_node(session, envelope_id, envelope_id, root, stats)
            .await
    }

    fn persist_node<'s, S: StoreSession>(
        &'s self,
        session: &'s mut S,
        envelope_id: i64,
        parent_id: i64,
        node: &'s mut PartNode,
        stats: &'s mut ImportStats,
    ) -> BoxFuture<'s, Result<(), StoreError>> {
        Box::pin(async move {
            let inserted = self.policy().check(session.insert_part(&node.fields).await)?;
            let Some(part_id) = inserted else {
                log::warn!(
                    "part of envelope {} not stored, skipping its subtree",
                    envelope_id
                );
                return Ok(());
            };
            node.id = Some(part_id);
            node.parent_id = Some(parent_id);
            node.envelope_id = Some(envelope_id);
            stats.parts += 1;

            let edge = session
                .insert_part_edge(envelope_id, part_id, parent_id)
                .await;
            if self.policy().check(edge)?.is_none() {
                log::warn!("edge of part {} to {} skipped", part_id, parent_id);
            }

            for child in node.children.iter_mut() {
                self.persist_node(&mut *session, envelope_id, part_id, child, &mut *stats)
                    .await?;
            }
            Ok(())
        })
    }
}
