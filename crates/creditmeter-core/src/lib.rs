//! Core types, traits, and errors for creditmeter
//!
//! This crate contains the foundational types shared across all creditmeter
//! components: wallet and ledger entities, usage-event lifecycle types,
//! pricing catalog entries, the [`LedgerStore`] repository trait, and the
//! [`BillingError`] taxonomy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Unique identifier for a tenant.
///
/// Every core entity — wallet, ledger transaction, usage event — is scoped
/// by tenant; there are no cross-tenant reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TenantId {
    /// Create a new random tenant ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

/// Model value that matches any model within a pricing tier.
pub const WILDCARD_MODEL: &str = "*";

/// Number of decimal places costs are rounded to.
pub const COST_SCALE: u32 = 6;

// ---------------------------------------------------------------------------
// Wallet types
// ---------------------------------------------------------------------------

/// Lifecycle status of a wallet.
///
/// Wallets are never physically deleted; `Closed` is the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    /// Wallet accepts credits and debits.
    Active,
    /// Debits are rejected; credits (top-ups) are still accepted.
    Suspended,
    /// Terminal — no further mutations.
    Closed,
}

impl std::fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for WalletStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("unknown wallet status: {s}")),
        }
    }
}

/// The cached credit balance for a tenant, backed by the ledger.
///
/// `current_balance` is always reconstructible as the running sum of all
/// ledger amounts for this wallet. The wallet row is the single shared
/// mutable resource per tenant and is only mutated inside the atomic
/// debit/credit operations of the [`LedgerStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// Unique identifier for this wallet.
    pub id: Uuid,
    /// Tenant this wallet belongs to.
    pub tenant_id: TenantId,
    /// Spendable balance. Never negative.
    pub current_balance: Decimal,
    /// Balance held against pending operations. Never negative.
    ///
    /// Declared for schema compatibility; no reservation workflow exists.
    pub reserved_balance: Decimal,
    /// ISO 4217 currency code, e.g. `"USD"`.
    pub currency: String,
    /// Lifecycle status.
    pub status: WalletStatus,
    /// When the wallet was created.
    pub created_at: DateTime<Utc>,
    /// When the wallet was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Balance available for new debits.
    #[must_use]
    pub fn available_balance(&self) -> Decimal {
        self.current_balance - self.reserved_balance
    }
}

/// Read-only balance view returned by `get_wallet_balance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Spendable balance.
    pub current_balance: Decimal,
    /// Balance held against pending operations.
    pub reserved_balance: Decimal,
    /// `current_balance - reserved_balance`.
    pub available_balance: Decimal,
    /// Wallet currency.
    pub currency: String,
    /// Wallet status.
    pub status: WalletStatus,
}

// ---------------------------------------------------------------------------
// Ledger types
// ---------------------------------------------------------------------------

/// Kind of balance mutation a ledger transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Administrative or purchased top-up.
    Topup,
    /// Usage charge against the balance.
    Debit,
    /// Refund or other positive correction.
    Credit,
    /// Manual balance adjustment.
    Adjustment,
    /// Balance hold (no workflow currently produces these).
    Reservation,
    /// Release of a hold.
    Release,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Topup => write!(f, "topup"),
            Self::Debit => write!(f, "debit"),
            Self::Credit => write!(f, "credit"),
            Self::Adjustment => write!(f, "adjustment"),
            Self::Reservation => write!(f, "reservation"),
            Self::Release => write!(f, "release"),
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "topup" => Ok(Self::Topup),
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            "adjustment" => Ok(Self::Adjustment),
            "reservation" => Ok(Self::Reservation),
            "release" => Ok(Self::Release),
            _ => Err(format!("unknown transaction type: {s}")),
        }
    }
}

/// An immutable, append-only record of one balance mutation.
///
/// Never updated or deleted after creation — the ledger is the audit source
/// of truth for wallet balances. Invariant, enforced at write time:
/// `balance_after == balance_before + amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Unique identifier for this transaction.
    pub id: Uuid,
    /// Tenant this transaction belongs to.
    pub tenant_id: TenantId,
    /// Wallet this transaction mutated.
    pub wallet_id: Uuid,
    /// Kind of mutation.
    pub tx_type: TransactionType,
    /// Signed amount: negative for debits, positive for credits.
    pub amount: Decimal,
    /// Wallet balance immediately before this mutation.
    pub balance_before: Decimal,
    /// Wallet balance immediately after this mutation.
    pub balance_after: Decimal,
    /// Type of the causing entity, e.g. `"usage_event"` or `"stripe_payment"`.
    pub reference_type: Option<String>,
    /// Identifier of the causing entity (back-reference only, not ownership).
    pub reference_id: Option<String>,
    /// Idempotency key. Unique per tenant.
    pub idempotency_key: String,
    /// Actor that initiated the mutation, if known.
    pub created_by: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
    /// When the transaction was committed.
    pub created_at: DateTime<Utc>,
}

/// Request payload for an atomic wallet credit or debit.
///
/// `amount` is the positive magnitude; the operation applies the sign
/// (debits append a negative ledger amount, credits a positive one).
#[derive(Debug, Clone)]
pub struct WalletMutation {
    /// Tenant whose wallet is mutated.
    pub tenant_id: TenantId,
    /// Kind of mutation to record in the ledger.
    pub tx_type: TransactionType,
    /// Positive magnitude of the mutation.
    pub amount: Decimal,
    /// Currency used if the wallet is created lazily by a credit.
    pub currency: String,
    /// Type of the causing entity.
    pub reference_type: Option<String>,
    /// Identifier of the causing entity.
    pub reference_id: Option<String>,
    /// Idempotency key. Retries with the same key return the original
    /// transaction without mutating the wallet again.
    pub idempotency_key: String,
    /// Actor that initiated the mutation.
    pub created_by: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
    /// Free-form metadata copied onto the ledger row.
    pub metadata: serde_json::Value,
}

impl WalletMutation {
    /// Create a mutation with the required fields and empty metadata.
    pub fn new(
        tenant_id: TenantId,
        tx_type: TransactionType,
        amount: Decimal,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            tx_type,
            amount,
            currency: default_currency(),
            reference_type: None,
            reference_id: None,
            idempotency_key: idempotency_key.into(),
            created_by: None,
            description: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// Set the causing entity back-reference.
    pub fn with_reference(mut self, reference_type: impl Into<String>, reference_id: impl Into<String>) -> Self {
        self.reference_type = Some(reference_type.into());
        self.reference_id = Some(reference_id.into());
        self
    }

    /// Set the human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the initiating actor.
    pub fn with_created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Usage event types
// ---------------------------------------------------------------------------

/// Lifecycle status of a usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageEventStatus {
    /// Created, awaiting charge.
    Pending,
    /// Successfully charged. Terminal.
    Charged,
    /// Cancelled by an administrative void, never charged. Terminal.
    Voided,
    /// A charge attempt failed. Chargeable again with the same key.
    Failed,
}

impl std::fmt::Display for UsageEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Charged => write!(f, "charged"),
            Self::Voided => write!(f, "voided"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for UsageEventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "charged" => Ok(Self::Charged),
            "voided" => Ok(Self::Voided),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown usage event status: {s}")),
        }
    }
}

/// One unit of metered usage as reported by a feature, before pricing.
///
/// Validated at the boundary: empty fields and non-positive quantities are
/// rejected before any pricing lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageItem {
    /// Usage category, e.g. `"stt"`, `"tts"`, `"llm"`, `"telephony"`.
    pub category: String,
    /// Upstream provider, e.g. `"openai"`, `"twilio"`.
    pub provider: String,
    /// Model or rate identifier, e.g. `"whisper-1"`.
    pub model: String,
    /// Billing unit, e.g. `"second"`, `"token"`, `"minute"`.
    pub unit: String,
    /// Quantity consumed, in `unit`s. Must be positive.
    pub quantity: Decimal,
    /// Optional human-readable description.
    pub description: Option<String>,
}

impl UsageItem {
    /// Create a usage item without a description.
    pub fn new(
        category: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        unit: impl Into<String>,
        quantity: Decimal,
    ) -> Self {
        Self {
            category: category.into(),
            provider: provider.into(),
            model: model.into(),
            unit: unit.into(),
            quantity,
            description: None,
        }
    }
}

/// A priced line item: a [`UsageItem`] plus the resolved price and cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedItem {
    /// Usage category.
    pub category: String,
    /// Upstream provider.
    pub provider: String,
    /// Model or rate identifier.
    pub model: String,
    /// Billing unit.
    pub unit: String,
    /// Quantity consumed.
    pub quantity: Decimal,
    /// Resolved unit price.
    pub unit_price: Decimal,
    /// `quantity × unit_price`, rounded to [`COST_SCALE`] decimal places.
    pub cost: Decimal,
    /// Optional human-readable description.
    pub description: Option<String>,
}

/// A priced, unpersisted preview of cost for a set of usage items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Priced line items, in input order.
    pub items: Vec<PricedItem>,
    /// Sum of item quantities.
    pub total_quantity: Decimal,
    /// Sum of item costs.
    pub total_cost: Decimal,
    /// Currency of all line items.
    pub currency: String,
}

/// A metered unit of feature consumption awaiting or having undergone
/// charging.
///
/// The `items` snapshot — including unit prices and costs — is frozen at
/// creation time; later pricing changes never alter an existing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Unique identifier for this event.
    pub id: Uuid,
    /// Tenant this event belongs to.
    pub tenant_id: TenantId,
    /// User the usage is attributed to, if any.
    pub user_id: Option<Uuid>,
    /// Feature that reported the usage, e.g. `"voice_agent"`.
    pub feature_key: String,
    /// Priced line items, frozen at creation.
    pub items: Vec<PricedItem>,
    /// Sum of item quantities.
    pub total_quantity: Decimal,
    /// Sum of item costs.
    pub total_cost: Decimal,
    /// Currency of the cost snapshot.
    pub currency: String,
    /// Lifecycle status.
    pub status: UsageEventStatus,
    /// Ledger transaction that charged this event. Set exactly once.
    pub ledger_transaction_id: Option<Uuid>,
    /// Idempotency key. Unique per tenant.
    pub idempotency_key: String,
    /// Caller's correlation identifier, e.g. an upstream call SID.
    pub external_reference_id: Option<String>,
    /// Error message from the most recent failed charge attempt.
    pub error_message: Option<String>,
    /// Charge attempt counter: incremented on every failure mark, including
    /// the first, so one failed attempt reads `retry_count == 1`.
    pub retry_count: i32,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
    /// When the event was created.
    pub created_at: DateTime<Utc>,
    /// When the event was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Request payload for creating a usage event.
#[derive(Debug, Clone)]
pub struct CreateUsageEvent {
    /// Tenant reporting the usage.
    pub tenant_id: TenantId,
    /// User the usage is attributed to, if any.
    pub user_id: Option<Uuid>,
    /// Feature that reported the usage.
    pub feature_key: String,
    /// Unpriced usage items.
    pub items: Vec<UsageItem>,
    /// Idempotency key. A second create with the same key returns the first
    /// persisted event unchanged.
    pub idempotency_key: String,
    /// Caller's correlation identifier.
    pub external_reference_id: Option<String>,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
}

impl CreateUsageEvent {
    /// Create a request with the required fields and empty metadata.
    pub fn new(
        tenant_id: TenantId,
        feature_key: impl Into<String>,
        items: Vec<UsageItem>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            user_id: None,
            feature_key: feature_key.into(),
            items,
            idempotency_key: idempotency_key.into(),
            external_reference_id: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attribute the usage to a user.
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Set the caller's correlation identifier.
    pub fn with_external_reference(mut self, reference: impl Into<String>) -> Self {
        self.external_reference_id = Some(reference.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Pricing catalog types
// ---------------------------------------------------------------------------

/// A priced `(category, provider, model, unit)` rule, optionally
/// tenant-specific and time-bounded.
///
/// `tenant_id == None` makes the entry a global fallback; `model == "*"`
/// matches any model within its tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    /// Unique identifier for this entry.
    pub id: Uuid,
    /// Tenant override scope; `None` for global entries.
    pub tenant_id: Option<TenantId>,
    /// Usage category.
    pub category: String,
    /// Upstream provider.
    pub provider: String,
    /// Model identifier, or [`WILDCARD_MODEL`].
    pub model: String,
    /// Billing unit.
    pub unit: String,
    /// Price per unit.
    pub unit_price: Decimal,
    /// Currency of the price.
    pub currency: String,
    /// Start of the effective window (inclusive).
    pub effective_from: DateTime<Utc>,
    /// End of the effective window (exclusive); `None` = open-ended.
    pub effective_to: Option<DateTime<Utc>>,
    /// Inactive entries are never selected.
    pub active: bool,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

impl PricingEntry {
    /// Whether this entry is in effect at `at`.
    #[must_use]
    pub fn in_effect_at(&self, at: DateTime<Utc>) -> bool {
        self.active
            && self.effective_from <= at
            && self.effective_to.map_or(true, |to| to > at)
    }
}

/// Lookup key for price resolution.
#[derive(Debug, Clone)]
pub struct PriceLookup {
    /// Tenant performing the lookup (tenant overrides win over globals).
    pub tenant_id: TenantId,
    /// Usage category.
    pub category: String,
    /// Upstream provider.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Billing unit.
    pub unit: String,
    /// Point in time the price must be effective at.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// Query parameters for filtering usage events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEventQuery {
    /// Tenant to query events for.
    pub tenant_id: TenantId,
    /// Filter by status.
    pub status: Option<UsageEventStatus>,
    /// Filter by feature key.
    pub feature_key: Option<String>,
    /// Start of the creation-time range (inclusive).
    pub start_time: Option<DateTime<Utc>>,
    /// End of the creation-time range (inclusive).
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Number of results to skip (for pagination).
    pub offset: Option<u32>,
}

impl UsageEventQuery {
    /// Create an unfiltered query for a tenant.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            status: None,
            feature_key: None,
            start_time: None,
            end_time: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by status.
    pub fn with_status(mut self, status: UsageEventStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by feature key.
    pub fn with_feature(mut self, feature_key: impl Into<String>) -> Self {
        self.feature_key = Some(feature_key.into());
        self
    }

    /// Add a creation-time range filter.
    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Set the limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the offset.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Query parameters for filtering ledger transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerQuery {
    /// Tenant to query transactions for.
    pub tenant_id: TenantId,
    /// Filter by transaction type.
    pub tx_type: Option<TransactionType>,
    /// Filter by reference type.
    pub reference_type: Option<String>,
    /// Start of the creation-time range (inclusive).
    pub start_time: Option<DateTime<Utc>>,
    /// End of the creation-time range (inclusive).
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Number of results to skip (for pagination).
    pub offset: Option<u32>,
}

impl LedgerQuery {
    /// Create an unfiltered query for a tenant.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            tx_type: None,
            reference_type: None,
            start_time: None,
            end_time: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by transaction type.
    pub fn with_type(mut self, tx_type: TransactionType) -> Self {
        self.tx_type = Some(tx_type);
        self
    }

    /// Filter by reference type.
    pub fn with_reference_type(mut self, reference_type: impl Into<String>) -> Self {
        self.reference_type = Some(reference_type.into());
        self
    }

    /// Add a creation-time range filter.
    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Set the limit.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the offset.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error taxonomy.
#[derive(thiserror::Error, Debug)]
pub enum BillingError {
    /// No pricing catalog entry matches the lookup. Hard stop — there is no
    /// implicit zero-cost default.
    #[error("no pricing entry for {category}/{provider}/{model}/{unit}")]
    PricingNotFound {
        /// Usage category looked up.
        category: String,
        /// Provider looked up.
        provider: String,
        /// Model looked up.
        model: String,
        /// Unit looked up.
        unit: String,
    },

    /// A debit would drive the balance negative. The transaction was rolled
    /// back; no partial state was persisted. Payment-required condition.
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Balance available at the time of the attempt.
        available: Decimal,
        /// Amount the debit requested.
        requested: Decimal,
    },

    /// Debit attempted against a tenant that was never funded.
    #[error("no wallet for tenant {tenant_id}")]
    WalletNotFound {
        /// The unfunded tenant.
        tenant_id: TenantId,
    },

    /// Attempt to charge a terminal voided usage event.
    #[error("cannot charge voided usage event {event_id}")]
    VoidedUsageEvent {
        /// The voided event.
        event_id: Uuid,
    },

    /// Malformed input rejected before any write.
    #[error("validation error: {0}")]
    Validation(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization / deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `std::result::Result<T, BillingError>`.
pub type Result<T> = std::result::Result<T, BillingError>;

// ---------------------------------------------------------------------------
// Repository trait (storage layer abstraction)
// ---------------------------------------------------------------------------

/// Repository for wallets, the ledger, usage events, and pricing entries.
///
/// Dev/tests: SQLite or in-memory. Production: PostgreSQL.
///
/// Mutating operations run inside a single database transaction and block
/// the caller until commit or rollback. The wallet row is acquired with an
/// exclusive lock, serializing concurrent mutations against the same wallet;
/// operations on different wallets never contend.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // -- Wallets & ledger ---------------------------------------------------

    /// Get a tenant's wallet, if one exists.
    async fn get_wallet(&self, tenant_id: TenantId) -> Result<Option<Wallet>>;

    /// Atomically credit a wallet and append the ledger transaction.
    ///
    /// Creates the wallet (balance 0) under the same transaction if the
    /// tenant has none. Idempotent on `(tenant_id, idempotency_key)`: a
    /// retry returns the original transaction without mutating the wallet.
    async fn credit_wallet(&self, mutation: &WalletMutation) -> Result<LedgerTransaction>;

    /// Atomically debit a wallet and append the ledger transaction.
    ///
    /// Fails with [`BillingError::WalletNotFound`] if the tenant has no
    /// wallet and with [`BillingError::InsufficientBalance`] — rolling back
    /// without partial state — if the debit would drive the balance
    /// negative. Idempotent on `(tenant_id, idempotency_key)`.
    async fn debit_wallet(&self, mutation: &WalletMutation) -> Result<LedgerTransaction>;

    /// Get a ledger transaction by ID.
    async fn get_ledger_transaction(
        &self,
        tenant_id: TenantId,
        id: Uuid,
    ) -> Result<Option<LedgerTransaction>>;

    /// Find a ledger transaction by idempotency key.
    async fn find_ledger_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<LedgerTransaction>>;

    /// List ledger transactions, newest first.
    async fn list_ledger_transactions(&self, query: &LedgerQuery)
        -> Result<Vec<LedgerTransaction>>;

    // -- Usage events -------------------------------------------------------

    /// Persist a new usage event, or return the existing one for the same
    /// `(tenant_id, idempotency_key)` unchanged.
    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<UsageEvent>;

    /// Get a usage event by ID.
    async fn get_usage_event(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<UsageEvent>>;

    /// Find a usage event by idempotency key.
    async fn find_usage_event_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<UsageEvent>>;

    /// Atomically debit the wallet and transition the event to `Charged`,
    /// in one transaction.
    ///
    /// An already-`Charged` event returns its existing ledger transaction
    /// without mutating the balance again; a `Voided` event fails with
    /// [`BillingError::VoidedUsageEvent`]. On any error the transaction is
    /// rolled back and the event is left untouched (failure marking is the
    /// caller's responsibility, outside the rolled-back transaction).
    async fn charge_usage_event(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
        debit: &WalletMutation,
    ) -> Result<(UsageEvent, LedgerTransaction)>;

    /// Durably record a failed charge attempt: sets status `Failed`, stores
    /// the error message, and increments the attempt counter.
    async fn mark_usage_event_failed(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
        error_message: &str,
    ) -> Result<UsageEvent>;

    /// Administratively void a pending or failed event. Terminal.
    async fn void_usage_event(&self, tenant_id: TenantId, event_id: Uuid) -> Result<UsageEvent>;

    /// List usage events, newest first.
    async fn list_usage_events(&self, query: &UsageEventQuery) -> Result<Vec<UsageEvent>>;

    // -- Pricing catalog ----------------------------------------------------

    /// Insert or replace a pricing entry.
    async fn upsert_pricing_entry(&self, entry: &PricingEntry) -> Result<()>;

    /// Fetch the active entries that could satisfy a lookup: matching
    /// `(category, provider, unit)`, with `tenant_id` in
    /// `{lookup.tenant_id, None}` and `model` in `{lookup.model, "*"}`.
    ///
    /// Tier selection is the catalog's job, not the store's.
    async fn find_pricing_candidates(&self, lookup: &PriceLookup) -> Result<Vec<PricingEntry>>;

    /// List the union of a tenant's entries and global entries, optionally
    /// filtered by category and provider. Display/audit only.
    async fn list_pricing(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Vec<PricingEntry>>;

    /// Health check for the store.
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_currency() -> String {
    "USD".to_string()
}

fn default_storage_profile() -> String {
    "sqlite".to_string()
}

fn default_database_url() -> String {
    "sqlite://creditmeter.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend profile: `"memory"`, `"sqlite"`, or `"postgres"`.
    #[serde(default = "default_storage_profile")]
    pub profile: String,
    /// Connection string for the selected backend.
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profile: default_storage_profile(),
            database_url: default_database_url(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, e.g. `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `"text"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level billing engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Default currency for lazily-created wallets and quotes.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BillingConfig {
    /// Load a configuration from a YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::Config`] if the file cannot be read or the
    /// YAML is invalid.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| BillingError::Config(format!("failed to parse config YAML: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use std::str::FromStr;

    #[test]
    fn wallet_status_roundtrip() {
        for status in [WalletStatus::Active, WalletStatus::Suspended, WalletStatus::Closed] {
            let parsed = WalletStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(WalletStatus::from_str("frozen").is_err());
    }

    #[test]
    fn transaction_type_roundtrip() {
        for tx_type in [
            TransactionType::Topup,
            TransactionType::Debit,
            TransactionType::Credit,
            TransactionType::Adjustment,
            TransactionType::Reservation,
            TransactionType::Release,
        ] {
            let parsed = TransactionType::from_str(&tx_type.to_string()).unwrap();
            assert_eq!(parsed, tx_type);
        }
    }

    #[test]
    fn usage_event_status_roundtrip() {
        for status in [
            UsageEventStatus::Pending,
            UsageEventStatus::Charged,
            UsageEventStatus::Voided,
            UsageEventStatus::Failed,
        ] {
            let parsed = UsageEventStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn pricing_entry_effective_window() {
        let now = Utc::now();
        let entry = PricingEntry {
            id: Uuid::new_v4(),
            tenant_id: None,
            category: "stt".into(),
            provider: "openai".into(),
            model: "whisper-1".into(),
            unit: "second".into(),
            unit_price: dec!(0.0001),
            currency: "USD".into(),
            effective_from: now - chrono::Duration::days(1),
            effective_to: Some(now + chrono::Duration::days(1)),
            active: true,
            created_at: now,
        };

        assert!(entry.in_effect_at(now));
        assert!(!entry.in_effect_at(now - chrono::Duration::days(2)));
        // effective_to is exclusive
        assert!(!entry.in_effect_at(now + chrono::Duration::days(1)));

        let mut inactive = entry.clone();
        inactive.active = false;
        assert!(!inactive.in_effect_at(now));

        let mut open_ended = entry;
        open_ended.effective_to = None;
        assert!(open_ended.in_effect_at(now + chrono::Duration::days(365)));
    }

    #[test]
    fn wallet_available_balance() {
        let wallet = Wallet {
            id: Uuid::new_v4(),
            tenant_id: TenantId::new(),
            current_balance: dec!(10.50),
            reserved_balance: dec!(2.25),
            currency: "USD".into(),
            status: WalletStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(wallet.available_balance(), dec!(8.25));
    }

    #[test]
    fn insufficient_balance_display_names_amounts() {
        let err = BillingError::InsufficientBalance {
            available: dec!(0.10),
            requested: dec!(0.50),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.10"));
        assert!(msg.contains("0.50"));
    }

    #[test]
    fn query_builders() {
        let tenant = TenantId::new();
        let q = UsageEventQuery::new(tenant)
            .with_status(UsageEventStatus::Charged)
            .with_feature("voice_agent")
            .with_limit(10)
            .with_offset(20);
        assert_eq!(q.status, Some(UsageEventStatus::Charged));
        assert_eq!(q.feature_key.as_deref(), Some("voice_agent"));
        assert_eq!(q.limit, Some(10));
        assert_eq!(q.offset, Some(20));

        let start = Utc::now() - chrono::Duration::days(7);
        let end = Utc::now();
        let q = LedgerQuery::new(tenant)
            .with_type(TransactionType::Debit)
            .with_reference_type("usage_event")
            .with_time_range(start, end);
        assert_eq!(q.tx_type, Some(TransactionType::Debit));
        assert_eq!(q.reference_type.as_deref(), Some("usage_event"));
        assert_eq!(q.start_time, Some(start));
        assert_eq!(q.end_time, Some(end));
    }

    #[test]
    fn config_load_minimal_yaml() {
        let yaml = r#"
currency: "EUR"
storage:
  profile: "memory"
"#;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();

        let config = BillingConfig::load(f.path()).unwrap();
        assert_eq!(config.currency, "EUR");
        assert_eq!(config.storage.profile, "memory");
        // defaults fill the rest
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn config_load_missing_file() {
        let result = BillingConfig::load(std::path::Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(BillingError::Config(_))));
    }
}
