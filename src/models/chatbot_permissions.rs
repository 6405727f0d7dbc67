use crate::models::schema::chatbot_permissions;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
}

/// Explicit read grant on a `shared` chatbot. At most one row per (chatbot, user).
#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = chatbot_permissions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ChatbotPermission {
    pub id: i64,
    pub chatbot_id: i64,
    pub user_id: Uuid,
    pub granted_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = chatbot_permissions)]
pub struct NewChatbotPermission {
    pub chatbot_id: i64,
    pub user_id: Uuid,
    pub granted_by: Uuid,
}

impl NewChatbotPermission {
    /// Inserts the grant unless it already exists. Returns whether a row was created.
    pub fn insert_if_absent(&self, conn: &mut PgConnection) -> Result<bool, PermissionError> {
        diesel::insert_into(chatbot_permissions::table)
            .values(self)
            .on_conflict((chatbot_permissions::chatbot_id, chatbot_permissions::user_id))
            .do_nothing()
            .execute(conn)
            .map(|rows| rows > 0)
            .map_err(PermissionError::DatabaseError)
    }
}

impl ChatbotPermission {
    pub fn exists(
        conn: &mut PgConnection,
        lookup_chatbot_id: i64,
        lookup_user_id: Uuid,
    ) -> Result<bool, PermissionError> {
        diesel::select(diesel::dsl::exists(
            chatbot_permissions::table
                .filter(chatbot_permissions::chatbot_id.eq(lookup_chatbot_id))
                .filter(chatbot_permissions::user_id.eq(lookup_user_id)),
        ))
        .get_result::<bool>(conn)
        .map_err(PermissionError::DatabaseError)
    }

    pub fn list_user_ids_for_chatbot(
        conn: &mut PgConnection,
        lookup_chatbot_id: i64,
    ) -> Result<Vec<Uuid>, PermissionError> {
        chatbot_permissions::table
            .filter(chatbot_permissions::chatbot_id.eq(lookup_chatbot_id))
            .order(chatbot_permissions::user_id.asc())
            .select(chatbot_permissions::user_id)
            .load::<Uuid>(conn)
            .map_err(PermissionError::DatabaseError)
    }

    /// Removes the grant if present. Returns the number of rows removed (0 or 1).
    pub fn delete_for_chatbot_and_user(
        conn: &mut PgConnection,
        lookup_chatbot_id: i64,
        lookup_user_id: Uuid,
    ) -> Result<usize, PermissionError> {
        diesel::delete(
            chatbot_permissions::table
                .filter(chatbot_permissions::chatbot_id.eq(lookup_chatbot_id))
                .filter(chatbot_permissions::user_id.eq(lookup_user_id)),
        )
        .execute(conn)
        .map_err(PermissionError::DatabaseError)
    }
}
