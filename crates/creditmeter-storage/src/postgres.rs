//! PostgreSQL storage backend.
//!
//! Provides [`PostgresLedgerStore`] — the production [`LedgerStore`], using
//! native UUID, TIMESTAMPTZ, NUMERIC, and JSONB column types. The database
//! enforces what the SQLite backend checks in code: the ledger equation
//! (`balance_after = balance_before + amount`) and non-negative balances are
//! CHECK constraints, and the wallet row is locked with `SELECT ... FOR
//! UPDATE` so concurrent mutations against one wallet serialize without
//! blocking other wallets.
//!
//! Gated behind the `postgres` Cargo feature.

use async_trait::async_trait;
use chrono::Utc;
use creditmeter_core::{
    BillingError, LedgerQuery, LedgerStore, LedgerTransaction, PriceLookup, PricingEntry, Result,
    TenantId, TransactionType, UsageEvent, UsageEventQuery, UsageEventStatus, Wallet,
    WalletMutation, WalletStatus, WILDCARD_MODEL,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Schema migrations
// ---------------------------------------------------------------------------

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS wallets (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL UNIQUE,
        current_balance NUMERIC(19, 6) NOT NULL DEFAULT 0 CHECK (current_balance >= 0),
        reserved_balance NUMERIC(19, 6) NOT NULL DEFAULT 0 CHECK (reserved_balance >= 0),
        currency VARCHAR(3) NOT NULL,
        status VARCHAR(20) NOT NULL CHECK (status IN ('active', 'suspended', 'closed')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS ledger_transactions (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        wallet_id UUID NOT NULL REFERENCES wallets(id),
        tx_type VARCHAR(20) NOT NULL,
        amount NUMERIC(19, 6) NOT NULL,
        balance_before NUMERIC(19, 6) NOT NULL,
        balance_after NUMERIC(19, 6) NOT NULL CHECK (balance_after = balance_before + amount),
        reference_type VARCHAR(100),
        reference_id VARCHAR(255),
        idempotency_key VARCHAR(255) NOT NULL,
        created_by VARCHAR(255),
        description TEXT,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, idempotency_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_ledger_created
        ON ledger_transactions(tenant_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_ledger_reference
        ON ledger_transactions(tenant_id, reference_type, reference_id)",
    "CREATE TABLE IF NOT EXISTS usage_events (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        user_id UUID,
        feature_key VARCHAR(100) NOT NULL,
        items JSONB NOT NULL DEFAULT '[]',
        total_quantity NUMERIC(19, 6) NOT NULL,
        total_cost NUMERIC(19, 6) NOT NULL,
        currency VARCHAR(3) NOT NULL,
        status VARCHAR(20) NOT NULL CHECK (status IN ('pending', 'charged', 'voided', 'failed')),
        ledger_transaction_id UUID,
        idempotency_key VARCHAR(255) NOT NULL,
        external_reference_id VARCHAR(255),
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        metadata JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, idempotency_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_events_created
        ON usage_events(tenant_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_usage_events_status
        ON usage_events(tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_usage_events_feature
        ON usage_events(tenant_id, feature_key)",
    "CREATE TABLE IF NOT EXISTS pricing_entries (
        id UUID PRIMARY KEY,
        tenant_id UUID,
        category VARCHAR(100) NOT NULL,
        provider VARCHAR(100) NOT NULL,
        model VARCHAR(255) NOT NULL,
        unit VARCHAR(50) NOT NULL,
        unit_price NUMERIC(19, 10) NOT NULL,
        currency VARCHAR(3) NOT NULL,
        effective_from TIMESTAMPTZ NOT NULL,
        effective_to TIMESTAMPTZ,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_pricing_lookup
        ON pricing_entries(category, provider, unit)",
];

async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| BillingError::Storage(format!("migration failed: {e}")))?;
    }
    Ok(())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// Row conversions
// ---------------------------------------------------------------------------

fn wallet_from_row(row: &PgRow) -> Result<Wallet> {
    let status: String = row.get("status");
    Ok(Wallet {
        id: row.get("id"),
        tenant_id: TenantId(row.get("tenant_id")),
        current_balance: row.get("current_balance"),
        reserved_balance: row.get("reserved_balance"),
        currency: row.get("currency"),
        status: WalletStatus::from_str(&status).map_err(BillingError::Storage)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn ledger_from_row(row: &PgRow) -> Result<LedgerTransaction> {
    let tx_type: String = row.get("tx_type");
    Ok(LedgerTransaction {
        id: row.get("id"),
        tenant_id: TenantId(row.get("tenant_id")),
        wallet_id: row.get("wallet_id"),
        tx_type: TransactionType::from_str(&tx_type).map_err(BillingError::Storage)?,
        amount: row.get("amount"),
        balance_before: row.get("balance_before"),
        balance_after: row.get("balance_after"),
        reference_type: row.get("reference_type"),
        reference_id: row.get("reference_id"),
        idempotency_key: row.get("idempotency_key"),
        created_by: row.get("created_by"),
        description: row.get("description"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    })
}

fn event_from_row(row: &PgRow) -> Result<UsageEvent> {
    let status: String = row.get("status");
    let items: serde_json::Value = row.get("items");
    Ok(UsageEvent {
        id: row.get("id"),
        tenant_id: TenantId(row.get("tenant_id")),
        user_id: row.get("user_id"),
        feature_key: row.get("feature_key"),
        items: serde_json::from_value(items)
            .map_err(|e| BillingError::Storage(format!("invalid items JSON: {e}")))?,
        total_quantity: row.get("total_quantity"),
        total_cost: row.get("total_cost"),
        currency: row.get("currency"),
        status: UsageEventStatus::from_str(&status).map_err(BillingError::Storage)?,
        ledger_transaction_id: row.get("ledger_transaction_id"),
        idempotency_key: row.get("idempotency_key"),
        external_reference_id: row.get("external_reference_id"),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn pricing_from_row(row: &PgRow) -> Result<PricingEntry> {
    Ok(PricingEntry {
        id: row.get("id"),
        tenant_id: row.get::<Option<Uuid>, _>("tenant_id").map(TenantId),
        category: row.get("category"),
        provider: row.get("provider"),
        model: row.get("model"),
        unit: row.get("unit"),
        unit_price: row.get("unit_price"),
        currency: row.get("currency"),
        effective_from: row.get("effective_from"),
        effective_to: row.get("effective_to"),
        active: row.get("active"),
        created_at: row.get("created_at"),
    })
}

// ---------------------------------------------------------------------------
// PostgresLedgerStore
// ---------------------------------------------------------------------------

enum MutationOutcome {
    Applied(LedgerTransaction),
    Replayed,
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Credit,
    Debit,
}

/// PostgreSQL-backed [`LedgerStore`].
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Connect to PostgreSQL and run schema migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to connect to PostgreSQL: {e}")))?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn find_ledger_by_key_in(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let row = sqlx::query(
            "SELECT * FROM ledger_transactions WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id.0)
        .bind(idempotency_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to look up idempotency key: {e}")))?;

        row.as_ref().map(ledger_from_row).transpose()
    }

    /// Fetch the wallet row under an exclusive lock, creating it first when
    /// `create_if_missing` is set.
    ///
    /// `ON CONFLICT (tenant_id) DO NOTHING` plus the re-select closes the
    /// creation race: two simultaneous first-credits produce one row and
    /// both lock it in turn.
    async fn acquire_wallet_in(
        conn: &mut PgConnection,
        tenant_id: TenantId,
        currency: &str,
        create_if_missing: bool,
    ) -> Result<Option<Wallet>> {
        if create_if_missing {
            sqlx::query(
                "INSERT INTO wallets (id, tenant_id, current_balance, reserved_balance,
                                      currency, status)
                 VALUES ($1, $2, 0, 0, $3, 'active')
                 ON CONFLICT (tenant_id) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(tenant_id.0)
            .bind(currency)
            .execute(&mut *conn)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to create wallet: {e}")))?;
        }

        let row = sqlx::query("SELECT * FROM wallets WHERE tenant_id = $1 FOR UPDATE")
            .bind(tenant_id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to lock wallet: {e}")))?;

        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn apply_mutation_in(
        conn: &mut PgConnection,
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
        sqlx::query("UPDATE wallets SET current_balance = $1, updated_at = $2 WHERE id = $3")
            .bind(balance_after)
            .bind(now)
            .bind(wallet.id)
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(ledger.id)
        .bind(ledger.tenant_id.0)
        .bind(ledger.wallet_id)
        .bind(ledger.tx_type.to_string())
        .bind(ledger.amount)
        .bind(ledger.balance_before)
        .bind(ledger.balance_after)
        .bind(&ledger.reference_type)
        .bind(&ledger.reference_id)
        .bind(&ledger.idempotency_key)
        .bind(&ledger.created_by)
        .bind(&ledger.description)
        .bind(&ledger.metadata)
        .bind(ledger.created_at)
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
        conn: &mut PgConnection,
        event: &UsageEvent,
        ledger_transaction_id: Uuid,
    ) -> Result<UsageEvent> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE usage_events
             SET status = 'charged', ledger_transaction_id = $1, error_message = NULL,
                 updated_at = $2
             WHERE tenant_id = $3 AND id = $4",
        )
        .bind(ledger_transaction_id)
        .bind(now)
        .bind(event.tenant_id.0)
        .bind(event.id)
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
                debug!(
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
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn get_wallet(&self, tenant_id: TenantId) -> Result<Option<Wallet>> {
        let row = sqlx::query("SELECT * FROM wallets WHERE tenant_id = $1")
            .bind(tenant_id.0)
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
        let row = sqlx::query("SELECT * FROM ledger_transactions WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.0)
            .bind(id)
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
            "SELECT * FROM ledger_transactions WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id.0)
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
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT * FROM ledger_transactions WHERE tenant_id = ",
        );
        qb.push_bind(query.tenant_id.0);

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
            qb.push_bind(start);
        }
        if let Some(end) = query.end_time {
            qb.push(" AND created_at <= ");
            qb.push_bind(end);
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

        let items = serde_json::to_value(&event.items)?;
        let insert = sqlx::query(
            "INSERT INTO usage_events
                (id, tenant_id, user_id, feature_key, items, total_quantity, total_cost,
                 currency, status, ledger_transaction_id, idempotency_key,
                 external_reference_id, error_message, retry_count, metadata,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(event.id)
        .bind(event.tenant_id.0)
        .bind(event.user_id)
        .bind(&event.feature_key)
        .bind(items)
        .bind(event.total_quantity)
        .bind(event.total_cost)
        .bind(&event.currency)
        .bind(event.status.to_string())
        .bind(event.ledger_transaction_id)
        .bind(&event.idempotency_key)
        .bind(&event.external_reference_id)
        .bind(&event.error_message)
        .bind(event.retry_count)
        .bind(&event.metadata)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok(event.clone()),
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
        let row = sqlx::query("SELECT * FROM usage_events WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.0)
            .bind(id)
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
            "SELECT * FROM usage_events WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id.0)
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

        // Lock the event row so a concurrent charge of the same event
        // serializes here rather than racing on the wallet.
        let row = sqlx::query("SELECT * FROM usage_events WHERE tenant_id = $1 AND id = $2 FOR UPDATE")
            .bind(tenant_id.0)
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to lock usage event: {e}")))?;

        let event = row
            .as_ref()
            .map(event_from_row)
            .transpose()?
            .ok_or_else(|| BillingError::Storage(format!("usage event {event_id} not found")))?;

        match event.status {
            UsageEventStatus::Charged => {
                let ledger_id = event.ledger_transaction_id.ok_or_else(|| {
                    BillingError::Storage(format!(
                        "charged event {event_id} has no ledger transaction"
                    ))
                })?;
                let row = sqlx::query(
                    "SELECT * FROM ledger_transactions WHERE tenant_id = $1 AND id = $2",
                )
                .bind(tenant_id.0)
                .bind(ledger_id)
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
                debug!(
                    %tenant_id,
                    %event_id,
                    "charge idempotency key collision resolved to existing transaction"
                );
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
        let row = sqlx::query(
            "UPDATE usage_events
             SET status = 'failed', error_message = $1, retry_count = retry_count + 1,
                 updated_at = NOW()
             WHERE tenant_id = $2 AND id = $3 AND status IN ('pending', 'failed')
             RETURNING *",
        )
        .bind(error_message)
        .bind(tenant_id.0)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to mark event failed: {e}")))?;

        match row {
            Some(ref r) => event_from_row(r),
            None => match self.get_usage_event(tenant_id, event_id).await? {
                None => Err(BillingError::Storage(format!(
                    "usage event {event_id} not found"
                ))),
                Some(e) => Err(BillingError::Validation(format!(
                    "cannot mark {} event {event_id} as failed",
                    e.status
                ))),
            },
        }
    }

    async fn void_usage_event(&self, tenant_id: TenantId, event_id: Uuid) -> Result<UsageEvent> {
        let row = sqlx::query(
            "UPDATE usage_events
             SET status = 'voided', updated_at = NOW()
             WHERE tenant_id = $1 AND id = $2 AND status IN ('pending', 'failed')
             RETURNING *",
        )
        .bind(tenant_id.0)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to void event: {e}")))?;

        match row {
            Some(ref r) => event_from_row(r),
            None => match self.get_usage_event(tenant_id, event_id).await? {
                None => Err(BillingError::Storage(format!(
                    "usage event {event_id} not found"
                ))),
                Some(e) if e.status == UsageEventStatus::Voided => Ok(e),
                Some(e) => Err(BillingError::Validation(format!(
                    "cannot void {} event {event_id}",
                    e.status
                ))),
            },
        }
    }

    async fn list_usage_events(&self, query: &UsageEventQuery) -> Result<Vec<UsageEvent>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM usage_events WHERE tenant_id = ");
        qb.push_bind(query.tenant_id.0);

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
            qb.push_bind(start);
        }
        if let Some(end) = query.end_time {
            qb.push(" AND created_at <= ");
            qb.push_bind(end);
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

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(format!("failed to list usage events: {e}")))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn upsert_pricing_entry(&self, entry: &PricingEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO pricing_entries
                (id, tenant_id, category, provider, model, unit, unit_price, currency,
                 effective_from, effective_to, active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO UPDATE SET
                unit_price = EXCLUDED.unit_price,
                currency = EXCLUDED.currency,
                effective_from = EXCLUDED.effective_from,
                effective_to = EXCLUDED.effective_to,
                active = EXCLUDED.active",
        )
        .bind(entry.id)
        .bind(entry.tenant_id.map(|t| t.0))
        .bind(&entry.category)
        .bind(&entry.provider)
        .bind(&entry.model)
        .bind(&entry.unit)
        .bind(entry.unit_price)
        .bind(&entry.currency)
        .bind(entry.effective_from)
        .bind(entry.effective_to)
        .bind(entry.active)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Storage(format!("failed to upsert pricing entry: {e}")))?;

        Ok(())
    }

    async fn find_pricing_candidates(&self, lookup: &PriceLookup) -> Result<Vec<PricingEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM pricing_entries
             WHERE category = $1 AND provider = $2 AND unit = $3
               AND (model = $4 OR model = $5)
               AND (tenant_id = $6 OR tenant_id IS NULL)
               AND active",
        )
        .bind(&lookup.category)
        .bind(&lookup.provider)
        .bind(&lookup.unit)
        .bind(&lookup.model)
        .bind(WILDCARD_MODEL)
        .bind(lookup.tenant_id.0)
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
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT * FROM pricing_entries WHERE (tenant_id = ",
        );
        qb.push_bind(tenant_id.0);
        qb.push(" OR tenant_id IS NULL) AND active");

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
