use chrono::Utc;
use sqlx::{FromRow, SqlitePool};

use clawchat_types::{
    ContentBlock, FederatedSession, FederatedTarget, GatewayConfig, GatewayRecord, Message,
    MessageRole, Session,
};

use crate::database::{with_busy_retry, StorageError};

/// Hard ceiling for message history queries; larger limits are clamped.
pub const MAX_MESSAGE_LIMIT: i64 = 500;

const SESSION_UPSERT_SQL: &str = r#"
INSERT INTO sessions (gateway_id, session_key, title, agent_id, model, created_at, last_activity)
VALUES (?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(gateway_id, session_key) DO UPDATE SET
    last_activity = excluded.last_activity,
    title = COALESCE(excluded.title, sessions.title),
    agent_id = COALESCE(excluded.agent_id, sessions.agent_id),
    model = COALESCE(excluded.model, sessions.model)
"#;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.message().contains("UNIQUE constraint failed"),
        _ => false,
    }
}

// ── Gateways ────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct GatewayRow {
    id: String,
    name: String,
    url: String,
    created_at: i64,
}

impl GatewayRow {
    fn into_record(self) -> GatewayRecord {
        GatewayRecord {
            id: self.id,
            name: self.name,
            url: self.url,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct GatewaySecretRow {
    id: String,
    name: String,
    url: String,
    token: Option<String>,
    password: Option<String>,
    created_at: i64,
}

#[derive(Clone)]
pub struct GatewayRepository {
    pool: SqlitePool,
}

impl GatewayRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add(&self, config: &GatewayConfig) -> Result<GatewayRecord, StorageError> {
        let result = sqlx::query(
            "INSERT INTO gateways (id, name, url, token, password, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(&config.url)
        .bind(&config.token)
        .bind(&config.password)
        .bind(config.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(GatewayRecord {
                id: config.id.clone(),
                name: config.name.clone(),
                url: config.url.clone(),
                created_at: config.created_at,
            }),
            Err(e) if is_unique_violation(&e) => {
                Err(StorageError::AlreadyExists(config.id.clone()))
            }
            Err(e) => Err(StorageError::Query(e.to_string())),
        }
    }

    /// Public listing. Token and password columns are never selected here.
    pub async fn list(&self) -> Result<Vec<GatewayRecord>, StorageError> {
        let rows = sqlx::query_as::<_, GatewayRow>(
            "SELECT id, name, url, created_at FROM gateways ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(GatewayRow::into_record).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<GatewayRecord>, StorageError> {
        let row = sqlx::query_as::<_, GatewayRow>(
            "SELECT id, name, url, created_at FROM gateways WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(row.map(GatewayRow::into_record))
    }

    /// Full configs including credentials. Only the connection manager
    /// consumes this; the result must never reach a response serializer.
    pub async fn list_with_secrets(&self) -> Result<Vec<GatewayConfig>, StorageError> {
        let rows = sqlx::query_as::<_, GatewaySecretRow>(
            "SELECT id, name, url, token, password, created_at FROM gateways \
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| GatewayConfig {
                id: row.id,
                name: row.name,
                url: row.url,
                token: row.token,
                password: row.password,
                created_at: row.created_at,
            })
            .collect())
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM gateways")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(count)
    }

    /// Delete a gateway, cascading to its sessions and their messages in
    /// one transaction.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        sqlx::query(
            "DELETE FROM messages WHERE session_id IN \
             (SELECT id FROM sessions WHERE gateway_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        sqlx::query("DELETE FROM sessions WHERE gateway_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        let result = sqlx::query("DELETE FROM gateways WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("gateway '{}'", id)));
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(())
    }
}

// ── Sessions ────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct SessionRow {
    id: i64,
    gateway_id: String,
    session_key: String,
    title: Option<String>,
    agent_id: Option<String>,
    model: Option<String>,
    created_at: i64,
    last_activity: i64,
}

impl SessionRow {
    fn into_session(self) -> Session {
        Session {
            id: self.id,
            gateway_id: self.gateway_id,
            session_key: self.session_key,
            title: self.title,
            agent_id: self.agent_id,
            model: self.model,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

const SESSION_COLUMNS: &str =
    "id, gateway_id, session_key, title, agent_id, model, created_at, last_activity";

#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_for_gateway(&self, gateway_id: &str) -> Result<Vec<Session>, StorageError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE gateway_id = ? \
             ORDER BY last_activity DESC"
        );
        let rows = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(gateway_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(SessionRow::into_session).collect())
    }

    pub async fn get(
        &self,
        gateway_id: &str,
        session_key: &str,
    ) -> Result<Option<Session>, StorageError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE gateway_id = ? AND session_key = ?"
        );
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(gateway_id)
            .bind(session_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(row.map(SessionRow::into_session))
    }

    /// Insert the session if it is new, otherwise bump `last_activity`.
    /// Optional fields only overwrite existing values when provided.
    pub async fn upsert(
        &self,
        gateway_id: &str,
        session_key: &str,
        title: Option<&str>,
        agent_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<Session, StorageError> {
        let now = now_millis();

        with_busy_retry(|| {
            sqlx::query(SESSION_UPSERT_SQL)
                .bind(gateway_id)
                .bind(session_key)
                .bind(title)
                .bind(agent_id)
                .bind(model)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
        })
        .await?;

        self.get(gateway_id, session_key)
            .await?
            .ok_or_else(|| StorageError::Query("session missing after upsert".to_string()))
    }

    /// Delete a session and its messages. Fails with `NotFound` when no
    /// such `(gateway_id, session_key)` pair exists.
    pub async fn delete(&self, gateway_id: &str, session_key: &str) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE gateway_id = ? AND session_key = ?")
                .bind(gateway_id)
                .bind(session_key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;

        let Some((session_id,)) = row else {
            return Err(StorageError::NotFound(format!(
                "session '{}' on gateway '{}'",
                session_key, gateway_id
            )));
        };

        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(())
    }
}

// ── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    session_id: i64,
    role: String,
    content: Option<String>,
    timestamp: Option<i64>,
    created_at: i64,
}

impl MessageRow {
    fn into_message(self) -> Option<Message> {
        let role = MessageRole::parse(&self.role)?;
        let content: Vec<ContentBlock> = self
            .content
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default();

        Some(Message {
            id: self.id,
            session_id: self.session_id,
            role,
            content,
            timestamp: self.timestamp,
            created_at: self.created_at,
        })
    }
}

#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a message to `(gateway_id, session_key)`, creating the
    /// session row when absent and bumping its `last_activity`, all in one
    /// transaction.
    pub async fn append(
        &self,
        gateway_id: &str,
        session_key: &str,
        role: MessageRole,
        content: &[ContentBlock],
        timestamp: Option<i64>,
    ) -> Result<Message, StorageError> {
        let content_json =
            serde_json::to_string(content).map_err(|e| StorageError::Query(e.to_string()))?;
        let now = now_millis();

        let (session_id, message_id) = with_busy_retry(|| {
            let pool = self.pool.clone();
            let content_json = content_json.clone();
            async move {
                let mut tx = pool.begin().await?;

                sqlx::query(
                    "INSERT INTO sessions (gateway_id, session_key, created_at, last_activity) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(gateway_id, session_key) DO UPDATE SET \
                         last_activity = excluded.last_activity",
                )
                .bind(gateway_id)
                .bind(session_key)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                let (session_id,): (i64,) = sqlx::query_as(
                    "SELECT id FROM sessions WHERE gateway_id = ? AND session_key = ?",
                )
                .bind(gateway_id)
                .bind(session_key)
                .fetch_one(&mut *tx)
                .await?;

                let result = sqlx::query(
                    "INSERT INTO messages (session_id, role, content, timestamp, created_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(session_id)
                .bind(role.as_str())
                .bind(content_json)
                .bind(timestamp)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok((session_id, result.last_insert_rowid()))
            }
        })
        .await?;

        Ok(Message {
            id: message_id,
            session_id,
            role,
            content: content.to_vec(),
            timestamp,
            created_at: now,
        })
    }

    /// Chronologically ascending slice of a session's messages.
    ///
    /// `limit` is clamped to [0, 500]; zero yields an empty list. `before`
    /// is an exclusive message-id cursor for paging backwards. An unknown
    /// session yields an empty list rather than an error.
    pub async fn list(
        &self,
        gateway_id: &str,
        session_key: &str,
        limit: i64,
        before: Option<i64>,
    ) -> Result<Vec<Message>, StorageError> {
        let limit = limit.clamp(0, MAX_MESSAGE_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let session: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE gateway_id = ? AND session_key = ?")
                .bind(gateway_id)
                .bind(session_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Query(e.to_string()))?;

        let Some((session_id,)) = session else {
            return Ok(Vec::new());
        };

        const MESSAGE_COLUMNS: &str = "id, session_id, role, content, timestamp, created_at";
        let rows: Vec<MessageRow> = match before {
            Some(cursor) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE session_id = ? AND id < ? ORDER BY id DESC LIMIT ?"
                );
                sqlx::query_as(&sql)
                    .bind(session_id)
                    .bind(cursor)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE session_id = ? ORDER BY id DESC LIMIT ?"
                );
                sqlx::query_as(&sql)
                    .bind(session_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(rows
            .into_iter()
            .rev()
            .filter_map(MessageRow::into_message)
            .collect())
    }
}

// ── Federated sessions ──────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct FederatedRow {
    id: String,
    title: Option<String>,
    targets: Option<String>,
    created_at: i64,
    last_activity: i64,
}

impl FederatedRow {
    fn into_federated(self) -> FederatedSession {
        let gateways: Vec<FederatedTarget> = self
            .targets
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default();

        FederatedSession {
            id: self.id,
            title: self.title,
            gateways,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

#[derive(Clone)]
pub struct FederatedSessionRepository {
    pool: SqlitePool,
}

impl FederatedSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        id: &str,
        title: Option<&str>,
        targets: &[FederatedTarget],
    ) -> Result<FederatedSession, StorageError> {
        let targets_json =
            serde_json::to_string(targets).map_err(|e| StorageError::Query(e.to_string()))?;
        let now = now_millis();

        sqlx::query(
            "INSERT INTO federated_sessions (id, title, targets, created_at, last_activity) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(title)
        .bind(&targets_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(FederatedSession {
            id: id.to_string(),
            title: title.map(str::to_string),
            gateways: targets.to_vec(),
            created_at: now,
            last_activity: now,
        })
    }

    pub async fn list(&self) -> Result<Vec<FederatedSession>, StorageError> {
        let rows = sqlx::query_as::<_, FederatedRow>(
            "SELECT id, title, targets, created_at, last_activity FROM federated_sessions \
             ORDER BY last_activity DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(FederatedRow::into_federated).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<FederatedSession>, StorageError> {
        let row = sqlx::query_as::<_, FederatedRow>(
            "SELECT id, title, targets, created_at, last_activity FROM federated_sessions \
             WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(row.map(FederatedRow::into_federated))
    }

    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM federated_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("federated session '{}'", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    struct Repos {
        _db: Database,
        gateways: GatewayRepository,
        sessions: SessionRepository,
        messages: MessageRepository,
        federated: FederatedSessionRepository,
    }

    async fn repos() -> Repos {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool().clone();
        Repos {
            gateways: GatewayRepository::new(pool.clone()),
            sessions: SessionRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            federated: FederatedSessionRepository::new(pool),
            _db: db,
        }
    }

    fn gateway(id: &str) -> GatewayConfig {
        GatewayConfig {
            id: id.to_string(),
            name: format!("Gateway {}", id),
            url: format!("ws://{}.local:18789", id),
            token: Some("SECRET-TOKEN".to_string()),
            password: None,
            created_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn add_then_list_contains_gateway() {
        let repos = repos().await;
        repos.gateways.add(&gateway("g1")).await.unwrap();

        let listed = repos.gateways.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "g1");
    }

    #[tokio::test]
    async fn duplicate_gateway_fails_and_leaves_list_unchanged() {
        let repos = repos().await;
        repos.gateways.add(&gateway("g1")).await.unwrap();

        let err = repos.gateways.add(&gateway("g1")).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(id) if id == "g1"));
        assert_eq!(repos.gateways.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn public_listing_carries_no_secrets() {
        let repos = repos().await;
        repos.gateways.add(&gateway("g1")).await.unwrap();

        let listed = repos.gateways.list().await.unwrap();
        let serialized = serde_json::to_string(&listed).unwrap();
        assert!(!serialized.contains("SECRET-TOKEN"));

        let with_secrets = repos.gateways.list_with_secrets().await.unwrap();
        assert_eq!(with_secrets[0].token.as_deref(), Some("SECRET-TOKEN"));
    }

    #[tokio::test]
    async fn delete_gateway_cascades_to_sessions_and_messages() {
        let repos = repos().await;
        repos.gateways.add(&gateway("g1")).await.unwrap();
        repos
            .messages
            .append(
                "g1",
                "s1",
                MessageRole::User,
                &[ContentBlock::text("hi")],
                None,
            )
            .await
            .unwrap();

        repos.gateways.delete("g1").await.unwrap();

        assert!(repos.sessions.list_for_gateway("g1").await.unwrap().is_empty());
        assert!(repos.messages.list("g1", "s1", 50, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_gateway_is_not_found() {
        let repos = repos().await;
        let err = repos.gateways.delete("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn upsert_touches_last_activity() {
        let repos = repos().await;
        let first = repos
            .sessions
            .upsert("g1", "s1", Some("Title"), None, None)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let second = repos
            .sessions
            .upsert("g1", "s1", None, Some("agent-1"), None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.last_activity >= first.last_activity);
        // Optional fields fill in without erasing earlier values.
        assert_eq!(second.title.as_deref(), Some("Title"));
        assert_eq!(second.agent_id.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn sessions_listed_by_recent_activity() {
        let repos = repos().await;
        repos.sessions.upsert("g1", "old", None, None, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        repos.sessions.upsert("g1", "new", None, None, None).await.unwrap();

        let listed = repos.sessions.list_for_gateway("g1").await.unwrap();
        assert_eq!(listed[0].session_key, "new");
        assert_eq!(listed[1].session_key, "old");
    }

    #[tokio::test]
    async fn append_auto_creates_session_and_roundtrips() {
        let repos = repos().await;
        let appended = repos
            .messages
            .append(
                "g1",
                "s1",
                MessageRole::User,
                &[ContentBlock::text("Hi")],
                Some(1_700_000_000_000),
            )
            .await
            .unwrap();

        let session = repos.sessions.get("g1", "s1").await.unwrap().unwrap();
        assert_eq!(session.id, appended.session_id);

        let listed = repos.messages.list("g1", "s1", 50, None).await.unwrap();
        let last = listed.last().unwrap();
        assert_eq!(last.role, MessageRole::User);
        assert_eq!(last.get_text(), "Hi");
        assert_eq!(last.timestamp, Some(1_700_000_000_000));
    }

    #[tokio::test]
    async fn last_activity_covers_message_creation() {
        let repos = repos().await;
        repos
            .messages
            .append("g1", "s1", MessageRole::User, &[ContentBlock::text("a")], None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        repos
            .messages
            .append("g1", "s1", MessageRole::Assistant, &[ContentBlock::text("b")], None)
            .await
            .unwrap();

        let session = repos.sessions.get("g1", "s1").await.unwrap().unwrap();
        let messages = repos.messages.list("g1", "s1", 50, None).await.unwrap();
        let newest = messages.iter().map(|m| m.created_at).max().unwrap();
        assert!(session.last_activity >= newest);
    }

    #[tokio::test]
    async fn message_order_is_chronological_ascending() {
        let repos = repos().await;
        for i in 0..5 {
            repos
                .messages
                .append(
                    "g1",
                    "s1",
                    MessageRole::User,
                    &[ContentBlock::text(format!("m{}", i))],
                    None,
                )
                .await
                .unwrap();
        }

        let listed = repos.messages.list("g1", "s1", 50, None).await.unwrap();
        assert_eq!(listed.len(), 5);
        for pair in listed.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
            assert!(pair[0].id < pair[1].id);
        }
        assert_eq!(listed[0].get_text(), "m0");
        assert_eq!(listed[4].get_text(), "m4");
    }

    #[tokio::test]
    async fn message_limit_boundaries() {
        let repos = repos().await;
        for i in 0..10 {
            repos
                .messages
                .append(
                    "g1",
                    "s1",
                    MessageRole::User,
                    &[ContentBlock::text(format!("m{}", i))],
                    None,
                )
                .await
                .unwrap();
        }

        assert!(repos.messages.list("g1", "s1", 0, None).await.unwrap().is_empty());

        // A huge limit clamps rather than erroring.
        let all = repos.messages.list("g1", "s1", 10_000, None).await.unwrap();
        assert_eq!(all.len(), 10);

        // The most recent 3 when limited.
        let tail = repos.messages.list("g1", "s1", 3, None).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[2].get_text(), "m9");
    }

    #[tokio::test]
    async fn before_cursor_is_exclusive() {
        let repos = repos().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let msg = repos
                .messages
                .append(
                    "g1",
                    "s1",
                    MessageRole::User,
                    &[ContentBlock::text(format!("m{}", i))],
                    None,
                )
                .await
                .unwrap();
            ids.push(msg.id);
        }

        let page = repos
            .messages
            .list("g1", "s1", 50, Some(ids[3]))
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert!(page.iter().all(|m| m.id < ids[3]));
    }

    #[tokio::test]
    async fn unknown_session_lists_empty() {
        let repos = repos().await;
        assert!(repos.messages.list("g1", "missing", 50, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_do_not_cross_talk() {
        let repos = repos().await;
        repos
            .messages
            .append("g1", "s1", MessageRole::User, &[ContentBlock::text("for s1")], None)
            .await
            .unwrap();
        repos
            .messages
            .append("g2", "s1", MessageRole::User, &[ContentBlock::text("for g2")], None)
            .await
            .unwrap();

        let g1 = repos.messages.list("g1", "s1", 50, None).await.unwrap();
        assert_eq!(g1.len(), 1);
        assert_eq!(g1[0].get_text(), "for s1");
    }

    #[tokio::test]
    async fn delete_session_removes_messages() {
        let repos = repos().await;
        repos
            .messages
            .append("g1", "s1", MessageRole::User, &[ContentBlock::text("x")], None)
            .await
            .unwrap();

        repos.sessions.delete("g1", "s1").await.unwrap();
        assert!(repos.sessions.get("g1", "s1").await.unwrap().is_none());
        assert!(repos.messages.list("g1", "s1", 50, None).await.unwrap().is_empty());

        let err = repos.sessions.delete("g1", "s1").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn federated_session_roundtrip() {
        let repos = repos().await;
        let targets = vec![
            FederatedTarget {
                gateway_id: "g1".to_string(),
                session_key: "s1".to_string(),
            },
            FederatedTarget {
                gateway_id: "g2".to_string(),
                session_key: "s2".to_string(),
            },
        ];

        let created = repos
            .federated
            .create("fed_1", Some("Pair"), &targets)
            .await
            .unwrap();
        assert_eq!(created.gateways, targets);

        let fetched = repos.federated.get("fed_1").await.unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("Pair"));
        assert_eq!(fetched.gateways, targets);

        assert_eq!(repos.federated.list().await.unwrap().len(), 1);

        repos.federated.delete("fed_1").await.unwrap();
        assert!(repos.federated.get("fed_1").await.unwrap().is_none());
        assert!(matches!(
            repos.federated.delete("fed_1").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }
}
