//! # Durable Storage
//!
//! The relational store behind the gateway: session records (upserted on
//! create and close, looked up by id for admin actions) and the asset /
//! account / gateway tables the guacd connector resolves targets from.
//! Queries are runtime-bound; the schema is bootstrapped at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use crate::policy::AccessAuth;
use crate::state::{Session, SessionStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id    TEXT PRIMARY KEY,
    session_type  TEXT NOT NULL,
    protocol      TEXT NOT NULL,
    uid           INTEGER NOT NULL,
    username      TEXT NOT NULL,
    asset_id      INTEGER NOT NULL,
    asset_name    TEXT NOT NULL,
    account_id    INTEGER NOT NULL,
    account_name  TEXT NOT NULL,
    gateway_id    INTEGER,
    client_ip     TEXT NOT NULL,
    connection_id TEXT NOT NULL,
    status        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    closed_at     TEXT
);

CREATE TABLE IF NOT EXISTS assets (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    ip          TEXT NOT NULL,
    gateway_id  INTEGER,
    access_auth TEXT
);

CREATE TABLE IF NOT EXISTS accounts (
    id       INTEGER PRIMARY KEY,
    name     TEXT NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS gateways (
    id       INTEGER PRIMARY KEY,
    name     TEXT NOT NULL,
    host     TEXT NOT NULL,
    port     INTEGER NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL
);
"#;

/// Creates the tables on first start.
pub async fn init_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

// ─── Session Records ────────────────────────────────────────────

/// The durable form of a session, also serialized as the `data` payload
/// of the connect endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub session_type: String,
    pub protocol: String,
    pub uid: i64,
    pub username: String,
    pub asset_id: i64,
    pub asset_name: String,
    pub account_id: i64,
    pub account_name: String,
    pub gateway_id: Option<i64>,
    pub client_ip: String,
    pub connection_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Snapshots a live session at the given status.
    pub fn of(session: &Session, status: SessionStatus, closed_at: Option<DateTime<Utc>>) -> Self {
        let meta = &session.meta;
        Self {
            session_id: meta.session_id.clone(),
            session_type: meta.session_type.as_str().to_string(),
            protocol: meta.protocol.clone(),
            uid: meta.uid,
            username: meta.username.clone(),
            asset_id: meta.asset_id,
            asset_name: meta.asset_name.clone(),
            account_id: meta.account_id,
            account_name: meta.account_name.clone(),
            gateway_id: meta.gateway_id,
            client_ip: meta.client_ip.clone(),
            connection_id: meta.connection_id.clone(),
            status: status.as_str().to_string(),
            created_at: session.created_at,
            closed_at,
        }
    }
}

/// Inserts or refreshes a session record.
pub async fn upsert_session(pool: &SqlitePool, record: &SessionRecord) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (
            session_id, session_type, protocol, uid, username,
            asset_id, asset_name, account_id, account_name, gateway_id,
            client_ip, connection_id, status, created_at, closed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_id) DO UPDATE SET
            status = excluded.status,
            connection_id = excluded.connection_id,
            closed_at = excluded.closed_at
        "#,
    )
    .bind(&record.session_id)
    .bind(&record.session_type)
    .bind(&record.protocol)
    .bind(record.uid)
    .bind(&record.username)
    .bind(record.asset_id)
    .bind(&record.asset_name)
    .bind(record.account_id)
    .bind(&record.account_name)
    .bind(record.gateway_id)
    .bind(&record.client_ip)
    .bind(&record.connection_id)
    .bind(&record.status)
    .bind(record.created_at)
    .bind(record.closed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Point lookup of a session that is still marked ONLINE.
pub async fn get_online_session(
    pool: &SqlitePool,
    session_id: &str,
) -> sqlx::Result<Option<SessionRecord>> {
    sqlx::query_as::<_, SessionRecord>(
        "SELECT * FROM sessions WHERE session_id = ? AND status = 'online'",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
}

// ─── Connection Targets ─────────────────────────────────────────

/// A remote machine registered as a connection target.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub ip: String,
    pub gateway_id: Option<i64>,
    /// JSON-encoded [`AccessAuth`]; NULL means unrestricted.
    pub access_auth: Option<String>,
}

impl Asset {
    /// Decodes the schedule, treating NULL or garbage as unrestricted.
    pub fn access_auth(&self) -> AccessAuth {
        match &self.access_auth {
            Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
                warn!("Asset {}: unreadable access_auth, allowing: {}", self.id, e);
                AccessAuth::default()
            }),
            None => AccessAuth::default(),
        }
    }
}

/// A credential pair bound to an asset.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub password: String,
}

/// An intermediate SSH hop some assets sit behind. The relay performs
/// the actual hop; the gateway only resolves and records it.
#[derive(Debug, Clone, sqlx::FromRow)]
#[allow(dead_code)]
pub struct Gateway {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub password: String,
}

pub async fn get_asset(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Asset>> {
    sqlx::query_as::<_, Asset>("SELECT * FROM assets WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_account(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Account>> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_gateway(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Gateway>> {
    sqlx::query_as::<_, Gateway>("SELECT * FROM gateways WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;
    // One connection so the in-memory database is shared.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}
