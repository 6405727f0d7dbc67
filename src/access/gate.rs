//! Chunk Access Gate: a chunk is readable iff its owning chatbot is readable.

use crate::access::{check_read, AccessSource, Principal};
use crate::db::DBError;
use crate::models::chatbots::Chatbot;
use crate::models::document_chunks::DocumentChunk;
use std::collections::HashMap;
use tracing::error;

/// Anything that belongs to exactly one chatbot.
pub trait OwnedByChatbot {
    fn chatbot_id(&self) -> i64;
}

impl OwnedByChatbot for DocumentChunk {
    fn chatbot_id(&self) -> i64 {
        self.chatbot_id
    }
}

/// Request-scoped gate. Each distinct chatbot is resolved and decided at most once.
pub struct ChunkAccessGate<'a, S: AccessSource + ?Sized> {
    source: &'a S,
    principal: Principal,
    decisions: HashMap<i64, bool>,
}

impl<'a, S: AccessSource + ?Sized> ChunkAccessGate<'a, S> {
    pub fn new(source: &'a S, principal: Principal) -> Self {
        Self {
            source,
            principal,
            decisions: HashMap::new(),
        }
    }

    /// Decides for a chatbot the caller already resolved, caching the result.
    pub fn can_read_chatbot(&mut self, chatbot: &Chatbot) -> Result<bool, DBError> {
        if let Some(decision) = self.decisions.get(&chatbot.id) {
            return Ok(*decision);
        }
        let decision = check_read(self.source, &self.principal, chatbot)?;
        self.decisions.insert(chatbot.id, decision);
        Ok(decision)
    }

    /// Decides by id. A dangling reference is an integrity fault and is denied.
    pub fn can_read_chatbot_id(&mut self, chatbot_id: i64) -> Result<bool, DBError> {
        if let Some(decision) = self.decisions.get(&chatbot_id) {
            return Ok(*decision);
        }

        let decision = match self.source.chatbot_by_id(chatbot_id)? {
            Some(chatbot) => check_read(self.source, &self.principal, &chatbot)?,
            None => {
                error!(
                    target: "data_integrity",
                    "Chunk references missing chatbot id={}; denying read",
                    chatbot_id
                );
                false
            }
        };

        self.decisions.insert(chatbot_id, decision);
        Ok(decision)
    }

    pub fn can_read_chunk<T: OwnedByChatbot + ?Sized>(
        &mut self,
        chunk: &T,
    ) -> Result<bool, DBError> {
        self.can_read_chatbot_id(chunk.chatbot_id())
    }

    /// Keeps only the items whose owning chatbot is readable, preserving order.
    pub fn retain_readable<T: OwnedByChatbot>(
        &mut self,
        items: Vec<T>,
    ) -> Result<Vec<T>, DBError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if self.can_read_chunk(&item)? {
                out.push(item);
            }
        }
        Ok(out)
    }
}
