//! Authorization for chatbots and their document chunks.

pub mod filter;
pub mod gate;
pub mod policy;

use crate::db::{DBConnection, DBError};
use crate::models::chatbots::Chatbot;
use serde::Serialize;
use uuid::Uuid;

pub use gate::ChunkAccessGate;

/// An authenticated caller. Passed explicitly into every authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Principal {
    pub user_id: Uuid,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

/// Storage lookups needed to decide read access.
pub trait AccessSource {
    fn chatbot_by_id(&self, chatbot_id: i64) -> Result<Option<Chatbot>, DBError>;
    fn has_grant(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError>;
}

impl<T: DBConnection + ?Sized> AccessSource for T {
    fn chatbot_by_id(&self, chatbot_id: i64) -> Result<Option<Chatbot>, DBError> {
        self.get_chatbot_by_id(chatbot_id)
    }

    fn has_grant(&self, chatbot_id: i64, user_id: Uuid) -> Result<bool, DBError> {
        DBConnection::has_grant(self, chatbot_id, user_id)
    }
}

/// Evaluates the read rules for a resolved chatbot, consulting grants only when needed.
pub fn check_read<S: AccessSource + ?Sized>(
    source: &S,
    principal: &Principal,
    chatbot: &Chatbot,
) -> Result<bool, DBError> {
    let granted = policy::needs_grant_lookup(principal, chatbot)
        && source.has_grant(chatbot.id, principal.user_id)?;
    Ok(policy::can_read(principal, chatbot, granted))
}

/// Result of checking whether a principal may mutate a chatbot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerCheck {
    Owner,
    /// Can read the chatbot but does not own it.
    NotOwner,
    /// Cannot even read it; callers must not reveal that it exists.
    Hidden,
}

pub fn check_owner<S: AccessSource + ?Sized>(
    source: &S,
    principal: &Principal,
    chatbot: &Chatbot,
) -> Result<OwnerCheck, DBError> {
    if chatbot.is_owned_by(principal.user_id) {
        return Ok(OwnerCheck::Owner);
    }
    if check_read(source, principal, chatbot)? {
        Ok(OwnerCheck::NotOwner)
    } else {
        Ok(OwnerCheck::Hidden)
    }
}
