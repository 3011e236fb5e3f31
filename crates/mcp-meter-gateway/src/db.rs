use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcp_meter::{
    BillingOutcome, ComplianceGate, ComplianceStatus, Credits, KeyRecord, LedgerError, MeterError,
    PrincipalResolver, ServerCatalog, UpstreamServer, UsageEvent, UsageRecorder, WalletLedger,
};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::error::GatewayError;

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// User account record
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub is_admin: bool,
    pub created_at: i64,
}

/// A tool price entry in a registration request
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ToolPrice {
    pub tool_name: String,
    pub price_in_credits: Credits,
}

/// Request to register a new upstream server
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterServer {
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: String,
    pub base_price: Option<Credits>,
    #[serde(default)]
    pub tool_prices: Vec<ToolPrice>,
}

/// SQLite-backed store behind a connection pool.
///
/// The pool is built once at startup and shared by every request. All
/// methods here are synchronous; async callers go through
/// [`Database::run_blocking`] or the `mcp_meter` trait impls, which move the
/// work onto Tokio's blocking pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn new(path: &str, pool_size: u32) -> Result<Self, GatewayError> {
        let in_memory = path == ":memory:";
        let manager = if in_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path)
        }
        .with_init(|c| {
            c.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
            c.execute_batch("PRAGMA foreign_keys=ON;")
        });

        // Every in-memory connection is a separate database, so pin a single
        // connection that never expires.
        let builder = if in_memory {
            Pool::builder()
                .max_size(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            Pool::builder().max_size(pool_size)
        };

        let db = Self {
            pool: builder.build(manager)?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, GatewayError> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<(), GatewayError> {
        let conn = self.conn()?;

        // Enable WAL mode for better concurrent read/write performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                key_hash TEXT UNIQUE NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

            CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY REFERENCES users(id),
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS mcp_servers (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL REFERENCES users(id),
                name TEXT,
                description TEXT,
                url TEXT NOT NULL,
                compliance_status TEXT NOT NULL DEFAULT 'UNVERIFIED'
                    CHECK (compliance_status IN ('UNVERIFIED', 'PASSED', 'FAILED')),
                base_price INTEGER CHECK (base_price IS NULL OR base_price >= 0),
                compliance_checked_at INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mcp_servers_owner ON mcp_servers(owner_id);

            CREATE TABLE IF NOT EXISTS tool_pricing (
                server_id TEXT NOT NULL REFERENCES mcp_servers(id) ON DELETE CASCADE,
                tool_name TEXT NOT NULL,
                price_in_credits INTEGER NOT NULL CHECK (price_in_credits >= 0),
                PRIMARY KEY (server_id, tool_name)
            );

            CREATE TABLE IF NOT EXISTS usage_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                api_key_id TEXT NOT NULL,
                cost_in_credits INTEGER NOT NULL,
                is_success INTEGER NOT NULL,
                billing_status TEXT NOT NULL,
                gateway_request_id TEXT NOT NULL,
                upstream_response_status INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_logs_user ON usage_logs(user_id, id);
            CREATE INDEX IF NOT EXISTS idx_usage_logs_request ON usage_logs(gateway_request_id);

            CREATE TRIGGER IF NOT EXISTS usage_logs_no_update
            BEFORE UPDATE ON usage_logs
            BEGIN
                SELECT RAISE(ABORT, 'usage_logs is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS usage_logs_no_delete
            BEFORE DELETE ON usage_logs
            BEGIN
                SELECT RAISE(ABORT, 'usage_logs is append-only');
            END;
            "#,
        )?;

        Ok(())
    }

    /// Run synchronous database work on the blocking thread pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&Database) -> Result<T, GatewayError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| GatewayError::Internal(format!("blocking task failed: {e}")))?
    }

    /// Cheap liveness query for health checks.
    pub fn ping(&self) -> Result<(), GatewayError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Users and API keys
    // ---------------------------------------------------------------------

    /// Create a user, an empty (or pre-funded) wallet and a first API key in
    /// one transaction. Returns the user and the new key id.
    pub fn create_user(
        &self,
        email: &str,
        is_admin: bool,
        initial_credits: Credits,
        key_hash: &str,
    ) -> Result<(User, String), GatewayError> {
        let mut conn = self.conn()?;
        let now = Utc::now().timestamp();
        let user_id = Uuid::new_v4().to_string();
        let key_id = Uuid::new_v4().to_string();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO users (id, email, is_admin, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, email, is_admin, now],
        )?;
        tx.execute(
            "INSERT INTO wallets (user_id, balance, updated_at) VALUES (?1, ?2, ?3)",
            params![user_id, initial_credits, now],
        )?;
        tx.execute(
            "INSERT INTO api_keys (id, user_id, key_hash, revoked, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
            params![key_id, user_id, key_hash, now],
        )?;
        tx.commit()?;

        Ok((
            User {
                id: user_id,
                email: email.to_string(),
                is_admin,
                created_at: now,
            },
            key_id,
        ))
    }

    /// Create the configured admin unless a user with that email exists.
    /// Returns true when a user was created.
    pub fn bootstrap_admin(&self, email: &str, key_hash: &str) -> Result<bool, GatewayError> {
        if self.find_user_by_email(email)?.is_some() {
            return Ok(false);
        }
        self.create_user(email, true, 0, key_hash)?;
        Ok(true)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>, GatewayError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, email, is_admin, created_at FROM users WHERE id = ?1",
                params![user_id],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>, GatewayError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, email, is_admin, created_at FROM users WHERE email = ?1",
                params![email],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Issue an additional key for an existing user. Returns the key id.
    pub fn issue_key(&self, user_id: &str, key_hash: &str) -> Result<String, GatewayError> {
        let conn = self.conn()?;
        if self_user_missing(&conn, user_id)? {
            return Err(GatewayError::UserNotFound(user_id.to_string()));
        }
        let key_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO api_keys (id, user_id, key_hash, revoked, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
            params![key_id, user_id, key_hash, Utc::now().timestamp()],
        )?;
        Ok(key_id)
    }

    pub fn revoke_key(&self, key_id: &str) -> Result<(), GatewayError> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE api_keys SET revoked = 1 WHERE id = ?1",
            params![key_id],
        )?;
        if rows == 0 {
            return Err(GatewayError::KeyNotFound(key_id.to_string()));
        }
        Ok(())
    }

    pub fn key_by_digest(&self, digest: &str) -> Result<Option<KeyRecord>, GatewayError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT k.id, k.key_hash, k.revoked, u.id, u.email, u.is_admin
                FROM api_keys k
                JOIN users u ON u.id = k.user_id
                WHERE k.key_hash = ?1
                "#,
                params![digest],
                |row| {
                    Ok(KeyRecord {
                        key_id: row.get(0)?,
                        key_hash: row.get(1)?,
                        revoked: row.get::<_, i32>(2)? == 1,
                        user_id: row.get(3)?,
                        email: row.get(4)?,
                        is_admin: row.get::<_, i32>(5)? == 1,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ---------------------------------------------------------------------
    // Servers and pricing
    // ---------------------------------------------------------------------

    /// Insert a server and its whole price table atomically. Either both are
    /// stored or neither is.
    pub fn register_server(
        &self,
        owner_id: &str,
        req: &RegisterServer,
    ) -> Result<UpstreamServer, GatewayError> {
        let mut conn = self.conn()?;
        let now = Utc::now().timestamp();
        let server_id = Uuid::new_v4().to_string();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO mcp_servers (id, owner_id, name, description, url, compliance_status, base_price, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'UNVERIFIED', ?6, ?7)
            "#,
            params![
                server_id,
                owner_id,
                req.name,
                req.description,
                req.url,
                req.base_price,
                now
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tool_pricing (server_id, tool_name, price_in_credits) VALUES (?1, ?2, ?3)",
            )?;
            for tp in &req.tool_prices {
                stmt.execute(params![server_id, tp.tool_name, tp.price_in_credits])?;
            }
        }
        tx.commit()?;

        Ok(UpstreamServer {
            id: server_id,
            owner_id: owner_id.to_string(),
            name: req.name.clone(),
            description: req.description.clone(),
            url: req.url.clone(),
            compliance_status: ComplianceStatus::Unverified,
            base_price: req.base_price,
            tool_prices: req
                .tool_prices
                .iter()
                .map(|tp| (tp.tool_name.clone(), tp.price_in_credits))
                .collect(),
            created_at: now,
        })
    }

    pub fn get_server(&self, server_id: &str) -> Result<Option<UpstreamServer>, GatewayError> {
        let conn = self.conn()?;
        load_server(&conn, server_id)
    }

    pub fn compliance_status(
        &self,
        server_id: &str,
    ) -> Result<Option<ComplianceStatus>, GatewayError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT compliance_status FROM mcp_servers WHERE id = ?1",
                params![server_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| s.parse().map_err(GatewayError::Database))
            .transpose()
    }

    pub fn set_compliance_status(
        &self,
        server_id: &str,
        status: ComplianceStatus,
    ) -> Result<(), GatewayError> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE mcp_servers SET compliance_status = ?2, compliance_checked_at = ?3 WHERE id = ?1",
            params![server_id, status.as_str(), Utc::now().timestamp()],
        )?;
        if rows == 0 {
            return Err(MeterError::ServerNotFound(server_id.to_string()).into());
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Wallets
    // ---------------------------------------------------------------------

    pub fn balance(&self, user_id: &str) -> Result<Option<Credits>, GatewayError> {
        let conn = self.conn()?;
        let balance = conn
            .query_row(
                "SELECT balance FROM wallets WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }

    /// Conditionally subtract `amount`. The balance check and the write are a
    /// single UPDATE, so concurrent debits can neither overdraw nor be lost.
    pub fn debit(&self, user_id: &str, amount: Credits) -> Result<Credits, LedgerError> {
        let mut conn = self.conn().map_err(ledger_storage)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(ledger_storage)?;

        let new_balance: Option<Credits> = tx
            .query_row(
                r#"
                UPDATE wallets
                SET balance = balance - ?2, updated_at = ?3
                WHERE user_id = ?1 AND balance >= ?2
                RETURNING balance
                "#,
                params![user_id, amount, Utc::now().timestamp()],
                |row| row.get(0),
            )
            .optional()
            .map_err(ledger_storage)?;

        let result = match new_balance {
            Some(balance) => Ok(balance),
            None => {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM wallets WHERE user_id = ?1",
                        params![user_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(ledger_storage)?;
                if exists.is_some() {
                    Err(LedgerError::InsufficientFunds)
                } else {
                    Err(LedgerError::WalletNotFound)
                }
            }
        };

        tx.commit().map_err(ledger_storage)?;
        result
    }

    /// Atomically add credits, creating the wallet if needed. Returns the new balance.
    ///
    /// A top-up that would push the balance past `i64::MAX` is refused; SQLite
    /// would otherwise silently store the sum as a REAL.
    pub fn add_credits(&self, user_id: &str, amount: Credits) -> Result<Credits, GatewayError> {
        let conn = self.conn()?;
        if self_user_missing(&conn, user_id)? {
            return Err(GatewayError::UserNotFound(user_id.to_string()));
        }
        let balance: Option<Credits> = conn
            .query_row(
                r#"
                INSERT INTO wallets (user_id, balance, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(user_id) DO UPDATE SET
                    balance = wallets.balance + excluded.balance,
                    updated_at = excluded.updated_at
                WHERE wallets.balance <= ?4 - excluded.balance
                RETURNING balance
                "#,
                params![user_id, amount, Utc::now().timestamp(), Credits::MAX],
                |row| row.get(0),
            )
            .optional()?;
        balance.ok_or_else(|| {
            GatewayError::InvalidPrice("top-up would overflow the wallet balance".to_string())
        })
    }

    // ---------------------------------------------------------------------
    // Usage log
    // ---------------------------------------------------------------------

    pub fn record_usage(&self, event: &UsageEvent) -> Result<(), GatewayError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO usage_logs (user_id, server_id, api_key_id, cost_in_credits, is_success,
                                    billing_status, gateway_request_id, upstream_response_status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                event.user_id,
                event.server_id,
                event.api_key_id,
                event.cost,
                event.is_success,
                event.billing.as_str(),
                event.gateway_request_id,
                event.upstream_status,
                event.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Usage events for a user, newest first.
    pub fn list_usage(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<UsageEvent>, GatewayError> {
        let limit = limit.clamp(1, 500);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, server_id, api_key_id, cost_in_credits, is_success, billing_status,
                   gateway_request_id, upstream_response_status, created_at
            FROM usage_logs
            WHERE user_id = ?1
            ORDER BY id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;
        let events = stmt
            .query_map(params![user_id, limit, offset], row_to_usage)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Usage events carrying a given correlation id.
    pub fn usage_by_request_id(&self, request_id: &str) -> Result<Vec<UsageEvent>, GatewayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, server_id, api_key_id, cost_in_credits, is_success, billing_status,
                   gateway_request_id, upstream_response_status, created_at
            FROM usage_logs
            WHERE gateway_request_id = ?1
            ORDER BY id
            "#,
        )?;
        let events = stmt
            .query_map(params![request_id], row_to_usage)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

fn ledger_storage(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn self_user_missing(conn: &Connection, user_id: &str) -> Result<bool, GatewayError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_none())
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        is_admin: row.get::<_, i32>(2)? == 1,
        created_at: row.get(3)?,
    })
}

fn row_to_usage(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageEvent> {
    let billing: String = row.get(5)?;
    let millis: i64 = row.get(8)?;
    Ok(UsageEvent {
        user_id: row.get(0)?,
        server_id: row.get(1)?,
        api_key_id: row.get(2)?,
        cost: row.get(3)?,
        is_success: row.get::<_, i32>(4)? == 1,
        billing: billing.parse().unwrap_or(BillingOutcome::Failed),
        gateway_request_id: row.get(6)?,
        upstream_status: row.get(7)?,
        timestamp: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
    })
}

fn load_server(conn: &Connection, server_id: &str) -> Result<Option<UpstreamServer>, GatewayError> {
    let row = conn
        .query_row(
            r#"
            SELECT id, owner_id, name, description, url, compliance_status, base_price, created_at
            FROM mcp_servers
            WHERE id = ?1
            "#,
            params![server_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<Credits>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((id, owner_id, name, description, url, status, base_price, created_at)) = row else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT tool_name, price_in_credits FROM tool_pricing WHERE server_id = ?1")?;
    let tool_prices = stmt
        .query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Credits>(1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(Some(UpstreamServer {
        id,
        owner_id,
        name,
        description,
        url,
        compliance_status: status.parse().map_err(GatewayError::Database)?,
        base_price,
        tool_prices,
        created_at,
    }))
}

// ---------------------------------------------------------------------------
// Metering collaborator impls
// ---------------------------------------------------------------------------

impl PrincipalResolver for Database {
    async fn find_key(&self, key_digest: &str) -> Result<Option<KeyRecord>, MeterError> {
        let digest = key_digest.to_string();
        Ok(self
            .run_blocking(move |db| db.key_by_digest(&digest))
            .await?)
    }
}

impl ServerCatalog for Database {
    async fn server(&self, server_id: &str) -> Result<Option<UpstreamServer>, MeterError> {
        let id = server_id.to_string();
        Ok(self.run_blocking(move |db| db.get_server(&id)).await?)
    }
}

impl ComplianceGate for Database {
    async fn status(&self, server_id: &str) -> Result<Option<ComplianceStatus>, MeterError> {
        let id = server_id.to_string();
        Ok(self
            .run_blocking(move |db| db.compliance_status(&id))
            .await?)
    }
}

impl WalletLedger for Database {
    async fn balance(&self, user_id: &str) -> Result<Credits, LedgerError> {
        let id = user_id.to_string();
        self.run_blocking(move |db| db.balance(&id))
            .await
            .map_err(ledger_storage)?
            .ok_or(LedgerError::WalletNotFound)
    }

    async fn debit(&self, user_id: &str, amount: Credits) -> Result<Credits, LedgerError> {
        let db = self.clone();
        let id = user_id.to_string();
        tokio::task::spawn_blocking(move || db.debit(&id, amount))
            .await
            .map_err(ledger_storage)?
    }
}

impl UsageRecorder for Database {
    async fn record(&self, event: &UsageEvent) -> Result<(), MeterError> {
        let event = event.clone();
        self.run_blocking(move |db| db.record_usage(&event))
            .await
            .map_err(|e| MeterError::RecordingFailure(e.to_string()))
    }
}
