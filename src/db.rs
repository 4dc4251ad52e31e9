use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::{ChatMessage, Conversation, ConversationCreate, ConversationUpdate};

pub const DEFAULT_TITLE: &str = "New Conversation";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.sqlite_dsn()).await
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite database {dsn}"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                collection_name TEXT,
                model TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS conversations_updated_at
                ON conversations (updated_at);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS messages_conversation
                ON messages (conversation_id, position);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_conversation(&self, create: &ConversationCreate) -> Result<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());
        let title = create
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(DEFAULT_TITLE);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, collection_name, model, tags, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(title)
        .bind(&create.collection_name)
        .bind(&create.model)
        .bind(serde_json::to_string(&create.tags)?)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        insert_messages_tx(&mut tx, &id, 0, &create.messages).await?;
        tx.commit().await?;

        self.get_conversation(&id)
            .await?
            .context("conversation vanished right after insert")
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, collection_name, model, tags, created_at, updated_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut conversation = row_to_conversation(row)?;
        conversation.messages = self
            .messages_for(&[conversation.id.clone()])
            .await?
            .remove(&conversation.id)
            .unwrap_or_default();
        Ok(Some(conversation))
    }

    /// Applies each present field; `messages` replaces the whole transcript.
    pub async fn update_conversation(
        &self,
        id: &str,
        update: &ConversationUpdate,
    ) -> Result<Option<Conversation>> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE conversations SET updated_at = ");
        qb.push_bind(timestamp(Utc::now()));
        if let Some(title) = &update.title {
            qb.push(", title = ");
            qb.push_bind(title.clone());
        }
        if let Some(model) = &update.model {
            qb.push(", model = ");
            qb.push_bind(model.clone());
        }
        if let Some(tags) = &update.tags {
            qb.push(", tags = ");
            qb.push_bind(serde_json::to_string(tags)?);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());
        qb.build().execute(&mut *tx).await?;

        if let Some(messages) = &update.messages {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            insert_messages_tx(&mut tx, id, 0, messages).await?;
        }

        tx.commit().await?;
        self.get_conversation(id).await
    }

    /// Adds messages after the existing transcript. Returns false when the conversation is missing.
    pub async fn append_messages(&self, id: &str, messages: &[ChatMessage]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(timestamp(Utc::now()))
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Ok(false);
        }

        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(position) + 1, 0) AS next FROM messages WHERE conversation_id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?
        .get("next");
        insert_messages_tx(&mut tx, id, next, messages).await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    /// Newest activity first, with the total count of stored conversations.
    pub async fn list_conversations(&self, skip: i64, limit: i64) -> Result<(Vec<Conversation>, i64)> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM conversations")
            .fetch_one(&self.pool)
            .await?
            .get("total");

        let rows = sqlx::query(
            r#"
            SELECT id, title, collection_name, model, tags, created_at, updated_at
            FROM conversations
            ORDER BY updated_at DESC, created_at DESC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = rows
            .into_iter()
            .map(row_to_conversation)
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<String> = conversations.iter().map(|c| c.id.clone()).collect();
        let mut messages = self.messages_for(&ids).await?;
        for conversation in &mut conversations {
            conversation.messages = messages.remove(&conversation.id).unwrap_or_default();
        }

        Ok((conversations, total))
    }

    async fn messages_for(&self, ids: &[String]) -> Result<HashMap<String, Vec<ChatMessage>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT conversation_id, role, content FROM messages WHERE conversation_id IN (",
        );
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY conversation_id, position ASC");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut out: HashMap<String, Vec<ChatMessage>> = HashMap::with_capacity(ids.len());
        for row in rows {
            out.entry(row.get::<String, _>("conversation_id"))
                .or_default()
                .push(ChatMessage {
                    role: row.get("role"),
                    content: row.get("content"),
                });
        }
        Ok(out)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_messages_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
    first_position: i64,
    messages: &[ChatMessage],
) -> Result<()> {
    let now = timestamp(Utc::now());
    for (offset, message) in messages.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO messages (conversation_id, position, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(conversation_id)
        .bind(first_position + offset as i64)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn row_to_conversation(row: SqliteRow) -> Result<Conversation> {
    let tags: String = row.get("tags");
    Ok(Conversation {
        id: row.get("id"),
        title: row.get("title"),
        collection_name: row.get("collection_name"),
        model: row.get("model"),
        tags: serde_json::from_str(&tags).context("corrupt conversation tags column")?,
        messages: Vec::new(),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at")),
    })
}

// Fixed-width UTC so lexical order in SQLite matches chronological order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn temp_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("test.sqlite3").display());
        (Database::connect(&dsn).await.unwrap(), dir)
    }

    fn create(title: Option<&str>, messages: Vec<ChatMessage>) -> ConversationCreate {
        ConversationCreate {
            title: title.map(str::to_string),
            collection_name: Some("documents".to_string()),
            model: None,
            tags: vec!["house".to_string()],
            messages,
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip_messages_in_order() {
        let (db, _dir) = temp_db().await;
        let created = db
            .create_conversation(&create(
                None,
                vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            ))
            .await
            .unwrap();
        assert_eq!(created.title, DEFAULT_TITLE);
        assert_eq!(created.tags, vec!["house"]);

        let loaded = db.get_conversation(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.messages, vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]);
        assert!(db.get_conversation("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_replaces_messages_and_bumps_updated_at() {
        let (db, _dir) = temp_db().await;
        let created = db
            .create_conversation(&create(Some("Pool"), vec![ChatMessage::user("old")]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let updated = db
            .update_conversation(
                &created.id,
                &ConversationUpdate {
                    title: Some("Pool hours".to_string()),
                    messages: Some(vec![ChatMessage::user("new")]),
                    ..ConversationUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "Pool hours");
        assert_eq!(updated.messages, vec![ChatMessage::user("new")]);
        assert_eq!(updated.tags, vec!["house"]);
        assert!(updated.updated_at > created.updated_at);

        let missing = db
            .update_conversation("missing", &ConversationUpdate::default())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn append_and_delete_cascade() {
        let (db, _dir) = temp_db().await;
        let created = db
            .create_conversation(&create(None, vec![ChatMessage::user("q1")]))
            .await
            .unwrap();

        assert!(db
            .append_messages(&created.id, &[ChatMessage::user("q2"), ChatMessage::assistant("a2")])
            .await
            .unwrap());
        assert!(!db.append_messages("missing", &[ChatMessage::user("x")]).await.unwrap());

        let loaded = db.get_conversation(&created.id).await.unwrap().unwrap();
        let contents: Vec<_> = loaded.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "q2", "a2"]);

        assert!(db.delete_conversation(&created.id).await.unwrap());
        assert!(!db.delete_conversation(&created.id).await.unwrap());

        let orphans: i64 = sqlx::query("SELECT COUNT(*) AS n FROM messages")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn list_orders_by_latest_activity() {
        let (db, _dir) = temp_db().await;
        let first = db.create_conversation(&create(Some("first"), vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = db.create_conversation(&create(Some("second"), vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        db.append_messages(&first.id, &[ChatMessage::user("bump")]).await.unwrap();

        let (page, total) = db.list_conversations(0, 10).await.unwrap();
        assert_eq!(total, 2);
        let ids: Vec<_> = page.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
        assert_eq!(page[0].messages.len(), 1);

        let (page, total) = db.list_conversations(1, 10).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, second.id);
    }
}
