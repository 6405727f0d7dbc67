//! Diesel filters compiled from `policy::READ_RULES`.
//!
//! These are applied to every principal-scoped list query in addition to the
//! row-level-security policies, so both storage paths follow the same rules.

use crate::access::policy::{ReadRule, READ_RULES};
use crate::access::Principal;
use crate::models::chatbots::Visibility;
use crate::models::document_chunks::ChunkFilter;
use crate::models::schema::{chatbot_permissions, chatbots, document_chunks};
use diesel::dsl::sql;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::Bool;
use uuid::Uuid;

pub type ChatbotFilter = Box<dyn BoxableExpression<chatbots::table, Pg, SqlType = Bool>>;

fn chatbot_rule(rule: ReadRule, user_id: Uuid) -> ChatbotFilter {
    match rule {
        ReadRule::Owner => Box::new(chatbots::owner_id.eq(user_id)),
        ReadRule::Public => Box::new(chatbots::visibility.eq(Visibility::Public)),
        ReadRule::SharedGrant => Box::new(
            chatbots::visibility.eq(Visibility::Shared).and(
                chatbots::id.eq_any(
                    chatbot_permissions::table
                        .filter(chatbot_permissions::user_id.eq(user_id))
                        .select(chatbot_permissions::chatbot_id),
                ),
            ),
        ),
    }
}

fn chunk_rule(rule: ReadRule, user_id: Uuid) -> ChunkFilter {
    match rule {
        ReadRule::Owner => Box::new(
            document_chunks::chatbot_id.eq_any(
                chatbots::table
                    .filter(chatbots::owner_id.eq(user_id))
                    .select(chatbots::id),
            ),
        ),
        ReadRule::Public => Box::new(
            document_chunks::chatbot_id.eq_any(
                chatbots::table
                    .filter(chatbots::visibility.eq(Visibility::Public))
                    .select(chatbots::id),
            ),
        ),
        ReadRule::SharedGrant => Box::new(
            document_chunks::chatbot_id
                .eq_any(
                    chatbots::table
                        .filter(chatbots::visibility.eq(Visibility::Shared))
                        .select(chatbots::id),
                )
                .and(
                    document_chunks::chatbot_id.eq_any(
                        chatbot_permissions::table
                            .filter(chatbot_permissions::user_id.eq(user_id))
                            .select(chatbot_permissions::chatbot_id),
                    ),
                ),
        ),
    }
}

/// Chatbots the principal may read.
pub fn readable_chatbots(principal: &Principal) -> ChatbotFilter {
    READ_RULES
        .iter()
        .map(|rule| chatbot_rule(*rule, principal.user_id))
        .reduce(|acc, next| -> ChatbotFilter { Box::new(acc.or(next)) })
        .unwrap_or_else(|| -> ChatbotFilter { Box::new(sql::<Bool>("FALSE")) })
}

/// Chunks whose owning chatbot the principal may read.
pub fn readable_chunks(principal: &Principal) -> ChunkFilter {
    READ_RULES
        .iter()
        .map(|rule| chunk_rule(*rule, principal.user_id))
        .reduce(|acc, next| -> ChunkFilter { Box::new(acc.or(next)) })
        .unwrap_or_else(|| -> ChunkFilter { Box::new(sql::<Bool>("FALSE")) })
}
