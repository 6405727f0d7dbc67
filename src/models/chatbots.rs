use crate::models::schema::chatbots;
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::sql_types::Bool;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ChatbotError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Chatbot not found")]
    NotFound,
}

/// Default read access tier of a chatbot, matching the `chatbot_visibility` database enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::models::schema::sql_types::ChatbotVisibility"]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Shared,
    Public,
}

impl Visibility {
    pub const ALL: [Visibility; 3] = [Visibility::Private, Visibility::Shared, Visibility::Public];

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Public => "public",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize, Deserialize)]
#[diesel(table_name = chatbots)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Chatbot {
    pub id: i64,
    pub uuid: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chatbot {
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.owner_id == user_id
    }

    pub fn get_by_id(conn: &mut PgConnection, id: i64) -> Result<Option<Chatbot>, ChatbotError> {
        chatbots::table
            .filter(chatbots::id.eq(id))
            .first::<Chatbot>(conn)
            .optional()
            .map_err(ChatbotError::DatabaseError)
    }

    pub fn get_by_uuid(
        conn: &mut PgConnection,
        uuid: Uuid,
    ) -> Result<Option<Chatbot>, ChatbotError> {
        chatbots::table
            .filter(chatbots::uuid.eq(uuid))
            .first::<Chatbot>(conn)
            .optional()
            .map_err(ChatbotError::DatabaseError)
    }

    /// Loads chatbots matching a read filter compiled by `access::filter`.
    pub fn list_filtered(
        conn: &mut PgConnection,
        readable: Box<dyn BoxableExpression<chatbots::table, Pg, SqlType = Bool>>,
    ) -> Result<Vec<Chatbot>, ChatbotError> {
        chatbots::table
            .filter(readable)
            .order((chatbots::created_at.desc(), chatbots::id.desc()))
            .load::<Chatbot>(conn)
            .map_err(ChatbotError::DatabaseError)
    }

    pub fn update_visibility(
        conn: &mut PgConnection,
        id: i64,
        visibility: Visibility,
    ) -> Result<Chatbot, ChatbotError> {
        diesel::update(chatbots::table.filter(chatbots::id.eq(id)))
            .set((
                chatbots::visibility.eq(visibility),
                chatbots::updated_at.eq(diesel::dsl::now),
            ))
            .get_result::<Chatbot>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => ChatbotError::NotFound,
                _ => ChatbotError::DatabaseError(e),
            })
    }

    /// Deletes the chatbot; permissions, documents, chunks and jobs cascade in the database.
    pub fn delete_by_id(conn: &mut PgConnection, id: i64) -> Result<(), ChatbotError> {
        let rows = diesel::delete(chatbots::table.filter(chatbots::id.eq(id)))
            .execute(conn)
            .map_err(ChatbotError::DatabaseError)?;

        if rows == 0 {
            Err(ChatbotError::NotFound)
        } else {
            Ok(())
        }
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = chatbots)]
pub struct NewChatbot {
    pub uuid: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
}

impl NewChatbot {
    pub fn new(
        owner_id: Uuid,
        name: impl Into<String>,
        description: Option<String>,
        visibility: Visibility,
    ) -> Self {
        NewChatbot {
            uuid: Uuid::new_v4(),
            owner_id,
            name: name.into(),
            description,
            visibility,
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> Result<Chatbot, ChatbotError> {
        diesel::insert_into(chatbots::table)
            .values(self)
            .get_result::<Chatbot>(conn)
            .map_err(ChatbotError::DatabaseError)
    }
}
