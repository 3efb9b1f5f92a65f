//! SQLite storage backend.
//!
//! Provides [`SqliteLedgerStore`], the default [`LedgerStore`] backed by a
//! SQLite connection pool. Identifiers, timestamps, and decimal amounts are
//! stored as TEXT and parsed on read; SQLite has no native UUID or NUMERIC
//! type, so the ledger equation and non-negative balance constraints are
//! enforced in the write path rather than in DDL (the PostgreSQL backend
//! carries them as CHECK constraints).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use creditmeter_core::{
    BillingError, LedgerQuery, LedgerStore, LedgerTransaction, PriceLookup, PricingEntry, Result,
    TenantId, TransactionType, UsageEvent, UsageEventQuery, UsageEventStatus, Wallet,
    WalletMutation, WalletStatus, WILDCARD_MODEL,
};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Schema migrations
// ---------------------------------------------------------------------------

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS wallets (
        id TEXT NOT NULL PRIMARY KEY,
        tenant_id TEXT NOT NULL UNIQUE,
        current_balance TEXT NOT NULL,
        reserved_balance TEXT NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('active', 'suspended', 'closed')),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ledger_transactions (
        id TEXT NOT NULL PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        wallet_id TEXT NOT NULL,
        tx_type TEXT NOT NULL,
        amount TEXT NOT NULL,
        balance_before TEXT NOT NULL,
        balance_after TEXT NOT NULL,
        reference_type TEXT,
        reference_id TEXT,
        idempotency_key TEXT NOT NULL,
        created_by TEXT,
        description TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE (tenant_id, idempotency_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_created
        ON ledger_transactions(tenant_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_reference
        ON ledger_transactions(tenant_id, reference_type, reference_id)",
    "CREATE TABLE IF NOT EXISTS usage_events (
        id TEXT NOT NULL PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        user_id TEXT,
        feature_key TEXT NOT NULL,
        items TEXT NOT NULL DEFAULT '[]',
        total_quantity TEXT NOT NULL,
        total_cost TEXT NOT NULL,
        currency TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'charged', 'voided', 'failed')),
        ledger_transaction_id TEXT,
        idempotency_key TEXT NOT NULL,
        external_reference_id TEXT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (tenant_id, idempotency_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_events_created
        ON usage_events(tenant_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_usage_events_status
        ON usage_events(tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_usage_events_feature
        ON usage_events(tenant_id, feature_key)",
    "CREATE TABLE IF NOT EXISTS pricing_entries (
        id TEXT NOT NULL PRIMARY KEY,
        tenant_id TEXT,
        category TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        unit TEXT NOT NULL,
        unit_price TEXT NOT NULL,
        currency TEXT NOT NULL,
        effective_from TEXT NOT NULL,
        effective_to TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_pricing_lookup
        ON pricing_entries(category, provider, unit)",
];

// ---------------------------------------------------------------------------
// Pool builder
// ---------------------------------------------------------------------------

/// Open (or create) a SQLite connection pool for the ledger.
///
/// The pool is restricted to a single connection: SQLite allows one writer
/// at a time and ledger transactions are short, so a larger pool only adds
/// SQLITE_BUSY churn — and for in-memory databases every connection would
/// get its own database.
async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| BillingError::Storage(format!("invalid database URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    sqlx::pool::PoolOptions::<Sqlite>::new()
        .max_connections(1)
        .connect_with(connect_opts)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to connect to SQLite: {e}")))
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| BillingError::Storage(format!("migration failed: {e}")))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

/// Parse a [`Uuid`] from a TEXT column value.
fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| BillingError::Storage(format!("invalid UUID '{s}': {e}")))
}

/// Parse a [`DateTime<Utc>`] from an RFC 3339 TEXT column value.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BillingError::Storage(format!("invalid datetime '{s}': {e}")))
}

/// Parse a [`Decimal`] from a TEXT column value.
fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| BillingError::Storage(format!("invalid decimal '{s}': {e}")))
}

fn parse_json(s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s)
        .map_err(|e| BillingError::Storage(format!("invalid metadata JSON: {e}")))
}

/// Whether a sqlx error is a uniqueness-constraint violation.
///
/// Idempotency-key collisions surface this way when two writers race the
/// same logical operation; the loser must resolve to the winner's row.
fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// Row conversions
// ---------------------------------------------------------------------------

fn wallet_from_row(row: &SqliteRow) -> Result<Wallet> {
    let status: String = row.get("status");
    Ok(Wallet {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        tenant_id: TenantId(parse_uuid(&row.get::<String, _>("tenant_id"))?),
        current_balance: parse_decimal(&row.get::<String, _>("current_balance"))?,
        reserved_balance: parse_decimal(&row.get::<String, _>("reserved_balance"))?,
        currency: row.get("currency"),
        status: WalletStatus::from_str(&status).map_err(BillingError::Storage)?,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

fn ledger_from_row(row: &SqliteRow) -> Result<LedgerTransaction> {
    let tx_type: String = row.get("tx_type");
    Ok(LedgerTransaction {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        tenant_id: TenantId(parse_uuid(&row.get::<String, _>("tenant_id"))?),
        wallet_id: parse_uuid(&row.get::<String, _>("wallet_id"))?,
        tx_type: TransactionType::from_str(&tx_type).map_err(BillingError::Storage)?,
        amount: parse_decimal(&row.get::<String, _>("amount"))?,
        balance_before: parse_decimal(&row.get::<String, _>("balance_before"))?,
        balance_after: parse_decimal(&row.get::<String, _>("balance_after"))?,
        reference_type: row.get("reference_type"),
        reference_id: row.get("reference_id"),
        idempotency_key: row.get("idempotency_key"),
        created_by: row.get("created_by"),
        description: row.get("description"),
        metadata: parse_json(&row.get::<String, _>("metadata"))?,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<UsageEvent> {
    let status: String = row.get("status");
    let items: String = row.get("items");
    Ok(UsageEvent {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        tenant_id: TenantId(parse_uuid(&row.get::<String, _>("tenant_id"))?),
        user_id: row
            .get::<Option<String>, _>("user_id")
            .map(|s| parse_uuid(&s))
            .transpose()?,
        feature_key: row.get("feature_key"),
        items: serde_json::from_str(&items)
            .map_err(|e| BillingError::Storage(format!("invalid items JSON: {e}")))?,
        total_quantity: parse_decimal(&row.get::<String, _>("total_quantity"))?,
        total_cost: parse_decimal(&row.get::<String, _>("total_cost"))?,
        currency: row.get("currency"),
        status: UsageEventStatus::from_str(&status).map_err(BillingError::Storage)?,
        ledger_transaction_id: row
            .get::<Option<String>, _>("ledger_transaction_id")
            .map(|s| parse_uuid(&s))
            .transpose()?,
        idempotency_key: row.get("idempotency_key"),
        external_reference_id: row.get("external_reference_id"),
        error_message: row.get("error_message"),
        retry_count: row.get::<i64, _>("retry_count") as i32,
        metadata: parse_json(&row.get::<String, _>("metadata"))?,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

fn pricing_from_row(row: &SqliteRow) -> Result<PricingEntry> {
    Ok(PricingEntry {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        tenant_id: row
            .get::<Option<String>, _>("tenant_id")
            .map(|s| parse_uuid(&s).map(TenantId))
            .transpose()?,
        category: row.get("category"),
        provider: row.get("provider"),
        model: row.get("model"),
        unit: row.get("unit"),
        unit_price: parse_decimal(&row.get::<String, _>("unit_price"))?,
        currency: row.get("currency"),
        effective_from: parse_datetime(&row.get::<String, _>("effective_from"))?,
        effective_to: row
            .get::<Option<String>, _>("effective_to")
            .map(|s| parse_datetime(&s))
            .transpose()?,
        active: row.get::<i64, _>("active") != 0,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
    })
}

// ---------------------------------------------------------------------------
// SqliteLedgerStore
// ---------------------------------------------------------------------------

/// Outcome of applying a wallet mutation inside a transaction.
enum MutationOutcome {
    /// The mutation was applied and this ledger row is staged for commit.
    Applied(LedgerTransaction),
    /// A concurrent writer already persisted this idempotency key; the
    /// caller must roll back and return the winner's row.
    Replayed,
}

/// Direction of a wallet mutation.
#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Credit,
    Debit,
}

/// SQLite-backed [`LedgerStore`].
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Open (or create) the database at `database_url` and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = open_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    // -- transaction-scoped helpers ----------------------------------------
    //
    // These take an open connection so they can participate in a
    // caller-owned transaction (`charge_usage_event` wraps a debit and a
    // status transition in one) or in an operation-owned one
    // (`debit_wallet` / `credit_wallet` open and commit their own scope).

    async fn find_ledger_by_key_in(
        conn: &mut SqliteConnection,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let row = sqlx::query(
            "SELECT * FROM ledger_transactions WHERE tenant_id = ?1 AND idempotency_key = ?2",
        )
        .bind(tenant_id.0.to_string())
        .bind(idempotency_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to look up idempotency key: {e}")))?;

        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn get_usage_event_in(
        conn: &mut SqliteConnection,
        tenant_id: TenantId,
        event_id: Uuid,
    ) -> Result<Option<UsageEvent>> {
        let row = sqlx::query("SELECT * FROM usage_events WHERE tenant_id = ?1 AND id = ?2")
            .bind(tenant_id.0.to_string())
            .bind(event_id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to get usage event: {e}")))?;

        row.as_ref().map(event_from_row).transpose()
    }

    /// Fetch the wallet row for `tenant_id`, creating it (balance 0) when
    /// `create_if_missing` is set.
    ///
    /// Creation is race-safe: the UNIQUE constraint on `tenant_id` plus
    /// `INSERT OR IGNORE` guarantees at most one wallet row even when two
    /// first-credits for a brand-new tenant arrive simultaneously; the
    /// re-select picks up whichever insert won.
    async fn acquire_wallet_in(
        conn: &mut SqliteConnection,
        tenant_id: TenantId,
        currency: &str,
        create_if_missing: bool,
    ) -> Result<Option<Wallet>> {
        if create_if_missing {
            let now = Utc::now();
            sqlx::query(
                "INSERT OR IGNORE INTO wallets
                    (id, tenant_id, current_balance, reserved_balance, currency, status,
                     created_at, updated_at)
                 VALUES (?1, ?2, '0', '0', ?3, 'active', ?4, ?4)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(tenant_id.0.to_string())
            .bind(currency)
            .bind(now.to_rfc3339())
            .execute(&mut *conn)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to create wallet: {e}")))?;
        }

        let row = sqlx::query("SELECT * FROM wallets WHERE tenant_id = ?1")
            .bind(tenant_id.0.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to load wallet: {e}")))?;

        row.as_ref().map(wallet_from_row).transpose()
    }

    /// Apply a credit or debit against the wallet row and stage the ledger
    /// append, all on the caller's connection.
    ///
    /// The enclosing transaction serializes concurrent mutations (SQLite
    /// allows a single writer); the balance math here therefore observes a
    /// stable `balance_before`.
    async fn apply_mutation_in(
        conn: &mut SqliteConnection,
        mutation: &WalletMutation,
        direction: Direction,
    ) -> Result<MutationOutcome> {
        // Zero is allowed: a fully-discounted usage event still charges,
        // appending a zero-amount ledger row.
        if mutation.amount < Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "mutation amount must not be negative, got {}",
                mutation.amount
            )));
        }

        let wallet = Self::acquire_wallet_in(
            conn,
            mutation.tenant_id,
            &mutation.currency,
            direction == Direction::Credit,
        )
        .await?;

        let wallet = match wallet {
            Some(w) => w,
            None => {
                return Err(BillingError::WalletNotFound {
                    tenant_id: mutation.tenant_id,
                })
            }
        };

        match (direction, wallet.status) {
            (_, WalletStatus::Closed) => {
                return Err(BillingError::Validation(format!(
                    "wallet for tenant {} is closed",
                    mutation.tenant_id
                )));
            }
            (Direction::Debit, WalletStatus::Suspended) => {
                return Err(BillingError::Validation(format!(
                    "wallet for tenant {} is suspended",
                    mutation.tenant_id
                )));
            }
            _ => {}
        }

        let signed_amount = match direction {
            Direction::Credit => mutation.amount,
            Direction::Debit => -mutation.amount,
        };
        let balance_before = wallet.current_balance;
        let balance_after = balance_before + signed_amount;

        if balance_after < Decimal::ZERO {
            return Err(BillingError::InsufficientBalance {
                available: wallet.available_balance(),
                requested: mutation.amount,
            });
        }

        let now = Utc::now();
        sqlx::query("UPDATE wallets SET current_balance = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(balance_after.to_string())
            .bind(now.to_rfc3339())
            .bind(wallet.id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to update balance: {e}")))?;

        let ledger = LedgerTransaction {
            id: Uuid::new_v4(),
            tenant_id: mutation.tenant_id,
            wallet_id: wallet.id,
            tx_type: mutation.tx_type,
            amount: signed_amount,
            balance_before,
            balance_after,
            reference_type: mutation.reference_type.clone(),
            reference_id: mutation.reference_id.clone(),
            idempotency_key: mutation.idempotency_key.clone(),
            created_by: mutation.created_by.clone(),
            description: mutation.description.clone(),
            metadata: mutation.metadata.clone(),
            created_at: now,
        };

        let insert = sqlx::query(
            "INSERT INTO ledger_transactions
                (id, tenant_id, wallet_id, tx_type, amount, balance_before, balance_after,
                 reference_type, reference_id, idempotency_key, created_by, description,
                 metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(ledger.id.to_string())
        .bind(ledger.tenant_id.0.to_string())
        .bind(ledger.wallet_id.to_string())
        .bind(ledger.tx_type.to_string())
        .bind(ledger.amount.to_string())
        .bind(ledger.balance_before.to_string())
        .bind(ledger.balance_after.to_string())
        .bind(&ledger.reference_type)
        .bind(&ledger.reference_id)
        .bind(&ledger.idempotency_key)
        .bind(&ledger.created_by)
        .bind(&ledger.description)
        .bind(serde_json::to_string(&ledger.metadata)?)
        .bind(ledger.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await;

        match insert {
            Ok(_) => Ok(MutationOutcome::Applied(ledger)),
            Err(e) if is_unique_violation(&e) => Ok(MutationOutcome::Replayed),
            Err(e) => Err(BillingError::Storage(format!(
                "failed to append ledger transaction: {e}"
            ))),
        }
    }

    async fn transition_event_to_charged_in(
        conn: &mut SqliteConnection,
        event: &UsageEvent,
        ledger_transaction_id: Uuid,
    ) -> Result<UsageEvent> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE usage_events
             SET status = 'charged', ledger_transaction_id = ?1, error_message = NULL,
                 updated_at = ?2
             WHERE tenant_id = ?3 AND id = ?4",
        )
        .bind(ledger_transaction_id.to_string())
        .bind(now.to_rfc3339())
        .bind(event.tenant_id.0.to_string())
        .bind(event.id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to mark event charged: {e}")))?;

        let mut charged = event.clone();
        charged.status = UsageEventStatus::Charged;
        charged.ledger_transaction_id = Some(ledger_transaction_id);
        charged.error_message = None;
        charged.updated_at = now;
        Ok(charged)
    }

    /// Run a wallet mutation in its own transaction, resolving idempotency
    /// replays to the previously-persisted transaction.
    async fn run_mutation(
        &self,
        mutation: &WalletMutation,
        direction: Direction,
    ) -> Result<LedgerTransaction> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Storage(format!("failed to begin transaction: {e}")))?;

        if let Some(existing) =
            Self::find_ledger_by_key_in(&mut tx, mutation.tenant_id, &mutation.idempotency_key)
                .await?
        {
            return Ok(existing);
        }

        match Self::apply_mutation_in(&mut tx, mutation, direction).await? {
            MutationOutcome::Applied(ledger) => {
                tx.commit().await.map_err(|e| {
                    BillingError::Storage(format!("failed to commit transaction: {e}"))
                })?;
                Ok(ledger)
            }
            MutationOutcome::Replayed => {
                tracing::debug!(
                    tenant_id = %mutation.tenant_id,
                    idempotency_key = %mutation.idempotency_key,
                    "idempotency key collision resolved to existing transaction"
                );
                drop(tx);
                self.find_ledger_by_key(mutation.tenant_id, &mutation.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Storage(
                            "idempotency key collided but winning transaction not found"
                                .to_string(),
                        )
                    })
            }
        }
    }

    fn build_event_query<'a>(query: &'a UsageEventQuery) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::new("SELECT * FROM usage_events WHERE tenant_id = ");
        qb.push_bind(query.tenant_id.0.to_string());

        if let Some(status) = query.status {
            qb.push(" AND status = ");
            qb.push_bind(status.to_string());
        }
        if let Some(ref feature) = query.feature_key {
            qb.push(" AND feature_key = ");
            qb.push_bind(feature.clone());
        }
        if let Some(start) = query.start_time {
            qb.push(" AND created_at >= ");
            qb.push_bind(start.to_rfc3339());
        }
        if let Some(end) = query.end_time {
            qb.push(" AND created_at <= ");
            qb.push_bind(end.to_rfc3339());
        }

        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            qb.push(" OFFSET ");
            qb.push_bind(offset as i64);
        }
        qb
    }

    fn build_ledger_query<'a>(query: &'a LedgerQuery) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::new("SELECT * FROM ledger_transactions WHERE tenant_id = ");
        qb.push_bind(query.tenant_id.0.to_string());

        if let Some(tx_type) = query.tx_type {
            qb.push(" AND tx_type = ");
            qb.push_bind(tx_type.to_string());
        }
        if let Some(ref reference_type) = query.reference_type {
            qb.push(" AND reference_type = ");
            qb.push_bind(reference_type.clone());
        }
        if let Some(start) = query.start_time {
            qb.push(" AND created_at >= ");
            qb.push_bind(start.to_rfc3339());
        }
        if let Some(end) = query.end_time {
            qb.push(" AND created_at <= ");
            qb.push_bind(end.to_rfc3339());
        }

        qb.push(" ORDER BY created_at DESC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            qb.push(" OFFSET ");
            qb.push_bind(offset as i64);
        }
        qb
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get_wallet(&self, tenant_id: TenantId) -> Result<Option<Wallet>> {
        let row = sqlx::query("SELECT * FROM wallets WHERE tenant_id = ?1")
            .bind(tenant_id.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to get wallet: {e}")))?;

        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn credit_wallet(&self, mutation: &WalletMutation) -> Result<LedgerTransaction> {
        self.run_mutation(mutation, Direction::Credit).await
    }

    async fn debit_wallet(&self, mutation: &WalletMutation) -> Result<LedgerTransaction> {
        self.run_mutation(mutation, Direction::Debit).await
    }

    async fn get_ledger_transaction(
        &self,
        tenant_id: TenantId,
        id: Uuid,
    ) -> Result<Option<LedgerTransaction>> {
        let row = sqlx::query("SELECT * FROM ledger_transactions WHERE tenant_id = ?1 AND id = ?2")
            .bind(tenant_id.0.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to get ledger transaction: {e}")))?;

        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn find_ledger_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let row = sqlx::query(
            "SELECT * FROM ledger_transactions WHERE tenant_id = ?1 AND idempotency_key = ?2",
        )
        .bind(tenant_id.0.to_string())
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to look up idempotency key: {e}")))?;

        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn list_ledger_transactions(
        &self,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerTransaction>> {
        let mut qb = Self::build_ledger_query(query);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to list ledger: {e}")))?;

        rows.iter().map(ledger_from_row).collect()
    }

    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<UsageEvent> {
        if let Some(existing) = self
            .find_usage_event_by_key(event.tenant_id, &event.idempotency_key)
            .await?
        {
            return Ok(existing);
        }

        let insert = sqlx::query(
            "INSERT INTO usage_events
                (id, tenant_id, user_id, feature_key, items, total_quantity, total_cost,
                 currency, status, ledger_transaction_id, idempotency_key,
                 external_reference_id, error_message, retry_count, metadata,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(event.id.to_string())
        .bind(event.tenant_id.0.to_string())
        .bind(event.user_id.map(|u| u.to_string()))
        .bind(&event.feature_key)
        .bind(serde_json::to_string(&event.items)?)
        .bind(event.total_quantity.to_string())
        .bind(event.total_cost.to_string())
        .bind(&event.currency)
        .bind(event.status.to_string())
        .bind(event.ledger_transaction_id.map(|u| u.to_string()))
        .bind(&event.idempotency_key)
        .bind(&event.external_reference_id)
        .bind(&event.error_message)
        .bind(event.retry_count as i64)
        .bind(serde_json::to_string(&event.metadata)?)
        .bind(event.created_at.to_rfc3339())
        .bind(event.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok(event.clone()),
            // Concurrent create with the same key: the first insert wins and
            // its payload is the one that sticks.
            Err(e) if is_unique_violation(&e) => self
                .find_usage_event_by_key(event.tenant_id, &event.idempotency_key)
                .await?
                .ok_or_else(|| {
                    BillingError::Storage(
                        "idempotency key collided but winning event not found".to_string(),
                    )
                }),
            Err(e) => Err(BillingError::Storage(format!(
                "failed to insert usage event: {e}"
            ))),
        }
    }

    async fn get_usage_event(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<UsageEvent>> {
        let row = sqlx::query("SELECT * FROM usage_events WHERE tenant_id = ?1 AND id = ?2")
            .bind(tenant_id.0.to_string())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to get usage event: {e}")))?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_usage_event_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<UsageEvent>> {
        let row = sqlx::query(
            "SELECT * FROM usage_events WHERE tenant_id = ?1 AND idempotency_key = ?2",
        )
        .bind(tenant_id.0.to_string())
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to look up usage event: {e}")))?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn charge_usage_event(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
        debit: &WalletMutation,
    ) -> Result<(UsageEvent, LedgerTransaction)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Storage(format!("failed to begin transaction: {e}")))?;

        let event = Self::get_usage_event_in(&mut tx, tenant_id, event_id)
            .await?
            .ok_or_else(|| {
                BillingError::Storage(format!("usage event {event_id} not found"))
            })?;

        match event.status {
            UsageEventStatus::Charged => {
                // Already charged: return the recorded transaction, no
                // balance mutation.
                let ledger_id = event.ledger_transaction_id.ok_or_else(|| {
                    BillingError::Storage(format!(
                        "charged event {event_id} has no ledger transaction"
                    ))
                })?;
                let row = sqlx::query(
                    "SELECT * FROM ledger_transactions WHERE tenant_id = ?1 AND id = ?2",
                )
                .bind(tenant_id.0.to_string())
                .bind(ledger_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    BillingError::Storage(format!("failed to load charge transaction: {e}"))
                })?;
                return Ok((event, ledger_from_row(&row)?));
            }
            UsageEventStatus::Voided => {
                return Err(BillingError::VoidedUsageEvent { event_id });
            }
            UsageEventStatus::Pending | UsageEventStatus::Failed => {}
        }

        // A prior attempt may have committed the debit but crashed before
        // the status transition; the deterministic idempotency key finds it
        // and the event is healed to charged without a second debit.
        if let Some(existing) =
            Self::find_ledger_by_key_in(&mut tx, tenant_id, &debit.idempotency_key).await?
        {
            let charged = Self::transition_event_to_charged_in(&mut tx, &event, existing.id).await?;
            tx.commit()
                .await
                .map_err(|e| BillingError::Storage(format!("failed to commit charge: {e}")))?;
            return Ok((charged, existing));
        }

        match Self::apply_mutation_in(&mut tx, debit, Direction::Debit).await? {
            MutationOutcome::Applied(ledger) => {
                let charged =
                    Self::transition_event_to_charged_in(&mut tx, &event, ledger.id).await?;
                tx.commit()
                    .await
                    .map_err(|e| BillingError::Storage(format!("failed to commit charge: {e}")))?;
                Ok((charged, ledger))
            }
            MutationOutcome::Replayed => {
                drop(tx);
                let ledger = self
                    .find_ledger_by_key(tenant_id, &debit.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Storage(
                            "idempotency key collided but winning transaction not found"
                                .to_string(),
                        )
                    })?;

                let mut tx = self.pool.begin().await.map_err(|e| {
                    BillingError::Storage(format!("failed to begin transaction: {e}"))
                })?;
                let charged =
                    Self::transition_event_to_charged_in(&mut tx, &event, ledger.id).await?;
                tx.commit()
                    .await
                    .map_err(|e| BillingError::Storage(format!("failed to commit charge: {e}")))?;
                Ok((charged, ledger))
            }
        }
    }

    async fn mark_usage_event_failed(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
        error_message: &str,
    ) -> Result<UsageEvent> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE usage_events
             SET status = 'failed', error_message = ?1, retry_count = retry_count + 1,
                 updated_at = ?2
             WHERE tenant_id = ?3 AND id = ?4 AND status IN ('pending', 'failed')",
        )
        .bind(error_message)
        .bind(now.to_rfc3339())
        .bind(tenant_id.0.to_string())
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to mark event failed: {e}")))?;

        if result.rows_affected() == 0 {
            let event = self.get_usage_event(tenant_id, event_id).await?;
            return match event {
                None => Err(BillingError::Storage(format!(
                    "usage event {event_id} not found"
                ))),
                Some(e) => Err(BillingError::Validation(format!(
                    "cannot mark {} event {event_id} as failed",
                    e.status
                ))),
            };
        }

        self.get_usage_event(tenant_id, event_id).await?.ok_or_else(|| {
            BillingError::Storage(format!("usage event {event_id} vanished after update"))
        })
    }

    async fn void_usage_event(&self, tenant_id: TenantId, event_id: Uuid) -> Result<UsageEvent> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE usage_events
             SET status = 'voided', updated_at = ?1
             WHERE tenant_id = ?2 AND id = ?3 AND status IN ('pending', 'failed')",
        )
        .bind(now.to_rfc3339())
        .bind(tenant_id.0.to_string())
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to void event: {e}")))?;

        if result.rows_affected() == 0 {
            let event = self.get_usage_event(tenant_id, event_id).await?;
            return match event {
                None => Err(BillingError::Storage(format!(
                    "usage event {event_id} not found"
                ))),
                // Voiding a voided event is a no-op.
                Some(e) if e.status == UsageEventStatus::Voided => Ok(e),
                Some(e) => Err(BillingError::Validation(format!(
                    "cannot void {} event {event_id}",
                    e.status
                ))),
            };
        }

        self.get_usage_event(tenant_id, event_id).await?.ok_or_else(|| {
            BillingError::Storage(format!("usage event {event_id} vanished after update"))
        })
    }

    async fn list_usage_events(&self, query: &UsageEventQuery) -> Result<Vec<UsageEvent>> {
        let mut qb = Self::build_event_query(query);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to list usage events: {e}")))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn upsert_pricing_entry(&self, entry: &PricingEntry) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO pricing_entries
                (id, tenant_id, category, provider, model, unit, unit_price, currency,
                 effective_from, effective_to, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(entry.id.to_string())
        .bind(entry.tenant_id.map(|t| t.0.to_string()))
        .bind(&entry.category)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.unit)
        .bind(entry.unit_price.to_string())
        .bind(&entry.currency)
        .bind(entry.effective_from.to_rfc3339())
        .bind(entry.effective_to.map(|t| t.to_rfc3339()))
        .bind(entry.active as i64)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to upsert pricing entry: {e}")))?;

        Ok(())
    }

    async fn find_pricing_candidates(&self, lookup: &PriceLookup) -> Result<Vec<PricingEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM pricing_entries
             WHERE category = ?1 AND provider = ?2 AND unit = ?3
               AND (model = ?4 OR model = ?5)
               AND (tenant_id = ?6 OR tenant_id IS NULL)
               AND active = 1",
        )
        .bind(&lookup.category)
        .bind(&lookup.provider)
        .bind(&lookup.unit)
        .bind(&lookup.model)
        .bind(WILDCARD_MODEL)
        .bind(lookup.tenant_id.0.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to query pricing: {e}")))?;

        rows.iter().map(pricing_from_row).collect()
    }

    async fn list_pricing(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Vec<PricingEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM pricing_entries WHERE (tenant_id = ",
        );
        qb.push_bind(tenant_id.0.to_string());
        qb.push(" OR tenant_id IS NULL) AND active = 1");

        if let Some(category) = category {
            qb.push(" AND category = ");
            qb.push_bind(category.to_string());
        }
        if let Some(provider) = provider {
            qb.push(" AND provider = ");
            qb.push_bind(provider.to_string());
        }
        qb.push(" ORDER BY category, provider, model, effective_from DESC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to list pricing: {e}")))?;

        rows.iter().map(pricing_from_row).collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("health check failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use creditmeter_core::TransactionType;
    use rust_decimal_macros::dec;

    async fn store() -> SqliteLedgerStore {
        SqliteLedgerStore::new("sqlite::memory:").await.unwrap()
    }

    fn topup(tenant: TenantId, amount: Decimal, key: &str) -> WalletMutation {
        WalletMutation::new(tenant, TransactionType::Topup, amount, key)
    }

    fn debit(tenant: TenantId, amount: Decimal, key: &str) -> WalletMutation {
        WalletMutation::new(tenant, TransactionType::Debit, amount, key)
    }

    fn pending_event(tenant: TenantId, cost: Decimal, key: &str) -> UsageEvent {
        let now = Utc::now();
        UsageEvent {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            user_id: None,
            feature_key: "voice_agent".into(),
            items: vec![],
            total_quantity: dec!(1),
            total_cost: cost,
            currency: "USD".into(),
            status: UsageEventStatus::Pending,
            ledger_transaction_id: None,
            idempotency_key: key.into(),
            external_reference_id: None,
            error_message: None,
            retry_count: 0,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn credit_creates_wallet_lazily() {
        let store = store().await;
        let tenant = TenantId::new();

        assert!(store.get_wallet(tenant).await.unwrap().is_none());

        let ledger = store
            .credit_wallet(&topup(tenant, dec!(25), "topup_1"))
            .await
            .unwrap();
        assert_eq!(ledger.amount, dec!(25));
        assert_eq!(ledger.balance_before, dec!(0));
        assert_eq!(ledger.balance_after, dec!(25));

        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(25));
        assert_eq!(wallet.status, WalletStatus::Active);
    }

    #[tokio::test]
    async fn debit_without_wallet_is_an_error() {
        let store = store().await;
        let tenant = TenantId::new();

        let err = store
            .debit_wallet(&debit(tenant, dec!(1), "debit_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WalletNotFound { .. }));
    }

    #[tokio::test]
    async fn debit_rejects_overdraft_without_partial_state() {
        let store = store().await;
        let tenant = TenantId::new();

        store
            .credit_wallet(&topup(tenant, dec!(0.10), "topup_1"))
            .await
            .unwrap();

        let err = store
            .debit_wallet(&debit(tenant, dec!(0.50), "debit_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientBalance { .. }));

        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(0.10));

        // No ledger row for the failed debit
        let ledger = store
            .list_ledger_transactions(&LedgerQuery::new(tenant))
            .await
            .unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn mutation_is_idempotent_on_key() {
        let store = store().await;
        let tenant = TenantId::new();

        let first = store
            .credit_wallet(&topup(tenant, dec!(10), "topup_1"))
            .await
            .unwrap();
        let replay = store
            .credit_wallet(&topup(tenant, dec!(10), "topup_1"))
            .await
            .unwrap();
        assert_eq!(first.id, replay.id);

        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(10));
    }

    #[tokio::test]
    async fn ledger_equation_holds_for_every_row() {
        let store = store().await;
        let tenant = TenantId::new();

        store.credit_wallet(&topup(tenant, dec!(100), "t1")).await.unwrap();
        store.debit_wallet(&debit(tenant, dec!(30), "d1")).await.unwrap();
        store.debit_wallet(&debit(tenant, dec!(20), "d2")).await.unwrap();
        store.credit_wallet(&topup(tenant, dec!(5), "t2")).await.unwrap();

        let rows = store
            .list_ledger_transactions(&LedgerQuery::new(tenant))
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
        for row in &rows {
            assert_eq!(row.balance_after, row.balance_before + row.amount);
        }

        // Balance reconstructs as the sum of ledger amounts
        let sum: Decimal = rows.iter().map(|r| r.amount).sum();
        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, sum);
        assert_eq!(wallet.current_balance, dec!(55));
    }

    #[tokio::test]
    async fn usage_event_insert_is_idempotent() {
        let store = store().await;
        let tenant = TenantId::new();

        let first = store
            .insert_usage_event(&pending_event(tenant, dec!(0.5), "call_42"))
            .await
            .unwrap();

        // Different payload, same key: first persisted event wins unchanged
        let mut second = pending_event(tenant, dec!(9.99), "call_42");
        second.feature_key = "different".into();
        let replay = store.insert_usage_event(&second).await.unwrap();

        assert_eq!(replay.id, first.id);
        assert_eq!(replay.total_cost, dec!(0.5));
        assert_eq!(replay.feature_key, "voice_agent");
    }

    #[tokio::test]
    async fn charge_debits_and_transitions_atomically() {
        let store = store().await;
        let tenant = TenantId::new();

        store.credit_wallet(&topup(tenant, dec!(100), "t1")).await.unwrap();
        let event = store
            .insert_usage_event(&pending_event(tenant, dec!(0.006), "call_1"))
            .await
            .unwrap();

        let key = format!("charge_usage_{}", event.id);
        let (charged, ledger) = store
            .charge_usage_event(tenant, event.id, &debit(tenant, dec!(0.006), &key))
            .await
            .unwrap();

        assert_eq!(charged.status, UsageEventStatus::Charged);
        assert_eq!(charged.ledger_transaction_id, Some(ledger.id));
        assert_eq!(ledger.amount, dec!(-0.006));

        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(99.994));
    }

    #[tokio::test]
    async fn charge_is_idempotent() {
        let store = store().await;
        let tenant = TenantId::new();

        store.credit_wallet(&topup(tenant, dec!(10), "t1")).await.unwrap();
        let event = store
            .insert_usage_event(&pending_event(tenant, dec!(1), "call_1"))
            .await
            .unwrap();

        let key = format!("charge_usage_{}", event.id);
        let (_, first) = store
            .charge_usage_event(tenant, event.id, &debit(tenant, dec!(1), &key))
            .await
            .unwrap();
        let (_, second) = store
            .charge_usage_event(tenant, event.id, &debit(tenant, dec!(1), &key))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(9));
    }

    #[tokio::test]
    async fn charge_of_voided_event_is_rejected() {
        let store = store().await;
        let tenant = TenantId::new();

        store.credit_wallet(&topup(tenant, dec!(10), "t1")).await.unwrap();
        let event = store
            .insert_usage_event(&pending_event(tenant, dec!(1), "call_1"))
            .await
            .unwrap();
        store.void_usage_event(tenant, event.id).await.unwrap();

        let key = format!("charge_usage_{}", event.id);
        let err = store
            .charge_usage_event(tenant, event.id, &debit(tenant, dec!(1), &key))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::VoidedUsageEvent { .. }));

        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(10));
    }

    #[tokio::test]
    async fn mark_failed_counts_attempts() {
        let store = store().await;
        let tenant = TenantId::new();

        let event = store
            .insert_usage_event(&pending_event(tenant, dec!(1), "call_1"))
            .await
            .unwrap();

        let failed = store
            .mark_usage_event_failed(tenant, event.id, "insufficient balance")
            .await
            .unwrap();
        assert_eq!(failed.status, UsageEventStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("insufficient balance"));

        let failed_again = store
            .mark_usage_event_failed(tenant, event.id, "still broke")
            .await
            .unwrap();
        assert_eq!(failed_again.retry_count, 2);
    }

    #[tokio::test]
    async fn mark_failed_rejects_charged_event() {
        let store = store().await;
        let tenant = TenantId::new();

        store.credit_wallet(&topup(tenant, dec!(10), "t1")).await.unwrap();
        let event = store
            .insert_usage_event(&pending_event(tenant, dec!(1), "call_1"))
            .await
            .unwrap();
        let key = format!("charge_usage_{}", event.id);
        store
            .charge_usage_event(tenant, event.id, &debit(tenant, dec!(1), &key))
            .await
            .unwrap();

        let err = store
            .mark_usage_event_failed(tenant, event.id, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn wallet_status_gates_mutations() {
        let store = store().await;
        let tenant = TenantId::new();
        store.credit_wallet(&topup(tenant, dec!(10), "t1")).await.unwrap();

        sqlx::query("UPDATE wallets SET status = 'suspended' WHERE tenant_id = ?1")
            .bind(tenant.0.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store
            .debit_wallet(&debit(tenant, dec!(1), "d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        // Top-ups are still accepted while suspended
        store.credit_wallet(&topup(tenant, dec!(5), "t2")).await.unwrap();

        sqlx::query("UPDATE wallets SET status = 'closed' WHERE tenant_id = ?1")
            .bind(tenant.0.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store
            .credit_wallet(&topup(tenant, dec!(5), "t3"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn list_queries_filter_and_paginate() {
        let store = store().await;
        let tenant = TenantId::new();
        store.credit_wallet(&topup(tenant, dec!(100), "t1")).await.unwrap();

        for i in 0..5 {
            let mut event = pending_event(tenant, dec!(1), &format!("call_{i}"));
            if i % 2 == 0 {
                event.feature_key = "campaign".into();
            }
            let event = store.insert_usage_event(&event).await.unwrap();
            if i == 0 {
                let key = format!("charge_usage_{}", event.id);
                store
                    .charge_usage_event(tenant, event.id, &debit(tenant, dec!(1), &key))
                    .await
                    .unwrap();
            }
        }

        let all = store
            .list_usage_events(&UsageEventQuery::new(tenant))
            .await
            .unwrap();
        assert_eq!(all.len(), 5);

        let charged = store
            .list_usage_events(
                &UsageEventQuery::new(tenant).with_status(UsageEventStatus::Charged),
            )
            .await
            .unwrap();
        assert_eq!(charged.len(), 1);

        let campaign = store
            .list_usage_events(&UsageEventQuery::new(tenant).with_feature("campaign"))
            .await
            .unwrap();
        assert_eq!(campaign.len(), 3);

        let page = store
            .list_usage_events(&UsageEventQuery::new(tenant).with_limit(2).with_offset(4))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);

        let debits = store
            .list_ledger_transactions(&LedgerQuery::new(tenant).with_type(TransactionType::Debit))
            .await
            .unwrap();
        assert_eq!(debits.len(), 1);
    }

    #[tokio::test]
    async fn pricing_candidates_cover_tenant_and_global_tiers() {
        let store = store().await;
        let tenant = TenantId::new();
        let now = Utc::now();

        let entry = |tenant_id: Option<TenantId>, model: &str, price: Decimal| PricingEntry {
            id: Uuid::new_v4(),
            tenant_id,
            category: "stt".into(),
            provider: "openai".into(),
            model: model.into(),
            unit: "second".into(),
            unit_price: price,
            currency: "USD".into(),
            effective_from: now - chrono::Duration::days(1),
            effective_to: None,
            active: true,
            created_at: now,
        };

        store.upsert_pricing_entry(&entry(None, "whisper-1", dec!(0.0001))).await.unwrap();
        store.upsert_pricing_entry(&entry(None, "*", dec!(0.0002))).await.unwrap();
        store
            .upsert_pricing_entry(&entry(Some(tenant), "whisper-1", dec!(0.00005)))
            .await
            .unwrap();
        // Another tenant's override must not leak
        store
            .upsert_pricing_entry(&entry(Some(TenantId::new()), "whisper-1", dec!(9.9)))
            .await
            .unwrap();

        let lookup = PriceLookup {
            tenant_id: tenant,
            category: "stt".into(),
            provider: "openai".into(),
            model: "whisper-1".into(),
            unit: "second".into(),
            at: now,
        };
        let candidates = store.find_pricing_candidates(&lookup).await.unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.unit_price != dec!(9.9)));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/ledger.db", dir.path().display());
        let tenant = TenantId::new();

        {
            let store = SqliteLedgerStore::new(&url).await.unwrap();
            store.credit_wallet(&topup(tenant, dec!(42), "t1")).await.unwrap();
        }

        let store = SqliteLedgerStore::new(&url).await.unwrap();
        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(42));
    }

    #[tokio::test]
    async fn health_check_passes() {
        let store = store().await;
        store.health_check().await.unwrap();
    }
}
