//! Read rules for chatbots and the chunks derived from them.
//!
//! `READ_RULES` is the one description of who may read a chatbot. It is evaluated
//! in-process by [`can_read`], compiled to a diesel filter in `access::filter`, and
//! rendered as SQL for the row-level-security policies installed by the migrations.
//! A principal may read a chatbot if any rule admits them.

use crate::access::Principal;
use crate::models::chatbots::{Chatbot, Visibility};

/// Session setting carrying the principal for row-level security.
pub const PRINCIPAL_SETTING: &str = "app.principal_id";

/// Database role that read-path transactions switch to.
pub const READER_ROLE: &str = "chatbot_reader";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRule {
    /// The creator of a chatbot can always read it, whatever its tier.
    Owner,
    /// Any authenticated principal can read a public chatbot.
    Public,
    /// A shared chatbot is readable by principals holding an explicit grant.
    SharedGrant,
}

pub const READ_RULES: [ReadRule; 3] = [ReadRule::Owner, ReadRule::Public, ReadRule::SharedGrant];

impl ReadRule {
    /// `granted` is whether a permission row exists for (chatbot, principal).
    pub fn admits(&self, principal: &Principal, chatbot: &Chatbot, granted: bool) -> bool {
        match self {
            ReadRule::Owner => chatbot.is_owned_by(principal.user_id),
            ReadRule::Public => chatbot.visibility == Visibility::Public,
            ReadRule::SharedGrant => chatbot.visibility == Visibility::Shared && granted,
        }
    }

    /// Renders the rule as a SQL condition over the chatbot row named `chatbot`.
    pub fn sql(&self, chatbot: &str) -> String {
        let principal = principal_sql();
        match self {
            ReadRule::Owner => format!("{chatbot}.owner_id = {principal}"),
            ReadRule::Public => format!("{chatbot}.visibility = '{}'", Visibility::Public),
            ReadRule::SharedGrant => format!(
                "({chatbot}.visibility = '{}' AND EXISTS (SELECT 1 FROM chatbot_permissions p \
                 WHERE p.chatbot_id = {chatbot}.id AND p.user_id = {principal}))",
                Visibility::Shared
            ),
        }
    }
}

/// Pure read decision. Never mutates anything and is safe on every request.
///
/// A `shared` chatbot with no grants is readable by its owner only. A stray grant on a
/// `private` or `public` chatbot has no effect.
pub fn can_read(principal: &Principal, chatbot: &Chatbot, granted: bool) -> bool {
    READ_RULES
        .iter()
        .any(|rule| rule.admits(principal, chatbot, granted))
}

/// Whether the decision for this pair depends on a permission row.
///
/// Callers use this to skip the grant lookup when the other rules already decide.
pub fn needs_grant_lookup(principal: &Principal, chatbot: &Chatbot) -> bool {
    chatbot.visibility == Visibility::Shared && !chatbot.is_owned_by(principal.user_id)
}

fn principal_sql() -> String {
    format!("current_setting('{PRINCIPAL_SETTING}', true)::uuid")
}

/// SQL condition admitting a chatbot row, as used by the `chatbots_read` policy.
pub fn chatbot_read_predicate(chatbot: &str) -> String {
    READ_RULES
        .iter()
        .map(|rule| rule.sql(chatbot))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// SQL condition admitting a chunk row: its owning chatbot must be readable.
pub fn chunk_read_predicate() -> String {
    format!(
        "EXISTS (SELECT 1 FROM chatbots c WHERE c.id = document_chunks.chatbot_id AND ({}))",
        chatbot_read_predicate("c")
    )
}

/// SQL condition for permission rows visible on the read path: a principal's own grants.
pub fn grant_read_predicate() -> String {
    format!("chatbot_permissions.user_id = {}", principal_sql())
}
