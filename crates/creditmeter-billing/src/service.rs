//! Billing orchestration.
//!
//! [`BillingService`] composes the catalog, quote engine, and ledger store:
//! quote → create usage event → charge (atomic debit + ledger append +
//! status transition). It is an explicit service object constructed with an
//! injected store so tests can substitute an isolated backend per test.

use crate::catalog::PricingCatalog;
use crate::quote;
use chrono::Utc;
use creditmeter_core::{
    BalanceSnapshot, BillingConfig, BillingError, CreateUsageEvent, LedgerQuery, LedgerStore,
    LedgerTransaction, PricingEntry, Quote, Result, TenantId, TransactionType, UsageEvent,
    UsageEventQuery, UsageEventStatus, UsageItem, Wallet, WalletMutation, WalletStatus,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of the deterministic idempotency key used for usage-event debits.
///
/// Derived from the event ID — never caller-supplied — so a usage event is
/// debited at most once no matter how many times charging is retried.
const CHARGE_KEY_PREFIX: &str = "charge_usage_";

/// Prepaid billing service for a multi-tenant platform.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn LedgerStore>,
    catalog: PricingCatalog,
    currency: String,
}

impl BillingService {
    /// Create a service over the given store with default configuration.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_config(store, &BillingConfig::default())
    }

    /// Create a service over the given store.
    pub fn with_config(store: Arc<dyn LedgerStore>, config: &BillingConfig) -> Self {
        let catalog = PricingCatalog::new(Arc::clone(&store));
        Self {
            store,
            catalog,
            currency: config.currency.clone(),
        }
    }

    /// The pricing catalog backing this service.
    pub fn catalog(&self) -> &PricingCatalog {
        &self.catalog
    }

    // -- Pricing ------------------------------------------------------------

    /// Resolve a unit price as of now. See [`PricingCatalog::resolve_price`].
    pub async fn resolve_price(
        &self,
        tenant_id: TenantId,
        category: &str,
        provider: &str,
        model: &str,
        unit: &str,
    ) -> Result<PricingEntry> {
        self.catalog
            .resolve_price(tenant_id, category, provider, model, unit, Utc::now())
            .await
    }

    /// Price usage items without persisting anything.
    pub async fn quote(&self, tenant_id: TenantId, items: &[UsageItem]) -> Result<Quote> {
        quote::quote(&self.catalog, tenant_id, items, Utc::now()).await
    }

    /// List catalog entries visible to a tenant.
    pub async fn list_pricing(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Vec<PricingEntry>> {
        self.catalog.list_pricing(tenant_id, category, provider).await
    }

    /// Insert or replace a catalog entry.
    pub async fn upsert_pricing_entry(&self, entry: &PricingEntry) -> Result<()> {
        self.catalog.upsert_entry(entry).await
    }

    // -- Usage events -------------------------------------------------------

    /// Create a usage event in `Pending` status with its cost snapshot
    /// frozen at creation time.
    ///
    /// Idempotent on `(tenant_id, idempotency_key)`: if an event already
    /// exists for the key it is returned unchanged — the new payload is
    /// ignored, not merged, and pricing is not re-queried.
    pub async fn create_usage_event(&self, request: CreateUsageEvent) -> Result<UsageEvent> {
        if let Some(existing) = self
            .store
            .find_usage_event_by_key(request.tenant_id, &request.idempotency_key)
            .await?
        {
            debug!(
                tenant_id = %request.tenant_id,
                idempotency_key = %request.idempotency_key,
                event_id = %existing.id,
                "usage event create replayed"
            );
            return Ok(existing);
        }

        let quote = quote::quote(&self.catalog, request.tenant_id, &request.items, Utc::now())
            .await?;

        let now = Utc::now();
        let event = UsageEvent {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            feature_key: request.feature_key,
            items: quote.items,
            total_quantity: quote.total_quantity,
            total_cost: quote.total_cost,
            currency: quote.currency,
            status: UsageEventStatus::Pending,
            ledger_transaction_id: None,
            idempotency_key: request.idempotency_key,
            external_reference_id: request.external_reference_id,
            error_message: None,
            retry_count: 0,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };

        let persisted = self.store.insert_usage_event(&event).await?;
        info!(
            tenant_id = %persisted.tenant_id,
            event_id = %persisted.id,
            feature_key = %persisted.feature_key,
            total_cost = %persisted.total_cost,
            "usage event created"
        );
        Ok(persisted)
    }

    /// Charge a usage event: one transaction debits the wallet, appends the
    /// ledger row, and marks the event `Charged`.
    ///
    /// Idempotent: an already-charged event returns its existing ledger
    /// transaction without touching the balance. Charging a voided event is
    /// an error. On failure the event is marked `Failed` — durably, outside
    /// the rolled-back transaction — and the error propagates to the caller.
    pub async fn charge_usage_event(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
    ) -> Result<LedgerTransaction> {
        let event = self
            .store
            .get_usage_event(tenant_id, event_id)
            .await?
            .ok_or_else(|| {
                BillingError::Validation(format!("usage event {event_id} not found"))
            })?;

        let (_, ledger) = self.charge_loaded_event(event).await?;
        Ok(ledger)
    }

    /// Create a usage event and synchronously charge it.
    ///
    /// Convenience composition for callers that want charge-or-fail
    /// semantics. Fully idempotent: replaying the same request returns the
    /// same event and transaction.
    pub async fn create_and_charge_usage_event(
        &self,
        request: CreateUsageEvent,
    ) -> Result<(UsageEvent, LedgerTransaction)> {
        let event = self.create_usage_event(request).await?;
        self.charge_loaded_event(event).await
    }

    /// Administratively void a pending or failed event. Terminal: a voided
    /// event can never be charged.
    pub async fn void_usage_event(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
    ) -> Result<UsageEvent> {
        let voided = self.store.void_usage_event(tenant_id, event_id).await?;
        info!(%tenant_id, %event_id, "usage event voided");
        Ok(voided)
    }

    /// List usage events, newest first.
    pub async fn list_usage_events(&self, query: &UsageEventQuery) -> Result<Vec<UsageEvent>> {
        self.store.list_usage_events(query).await
    }

    async fn charge_loaded_event(
        &self,
        event: UsageEvent,
    ) -> Result<(UsageEvent, LedgerTransaction)> {
        let tenant_id = event.tenant_id;

        match event.status {
            UsageEventStatus::Charged => {
                // Idempotent no-op: return the transaction that charged it.
                let ledger_id = event.ledger_transaction_id.ok_or_else(|| {
                    BillingError::Storage(format!(
                        "charged event {} has no ledger transaction",
                        event.id
                    ))
                })?;
                let ledger = self
                    .store
                    .get_ledger_transaction(tenant_id, ledger_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Storage(format!(
                            "ledger transaction {ledger_id} not found"
                        ))
                    })?;
                debug!(%tenant_id, event_id = %event.id, "charge replayed");
                return Ok((event, ledger));
            }
            UsageEventStatus::Voided => {
                return Err(BillingError::VoidedUsageEvent { event_id: event.id });
            }
            UsageEventStatus::Pending | UsageEventStatus::Failed => {}
        }

        let debit = WalletMutation {
            tenant_id,
            tx_type: TransactionType::Debit,
            amount: event.total_cost,
            currency: event.currency.clone(),
            reference_type: Some("usage_event".to_string()),
            reference_id: Some(event.id.to_string()),
            idempotency_key: format!("{CHARGE_KEY_PREFIX}{}", event.id),
            created_by: None,
            description: Some(format!("charge for {}", event.feature_key)),
            metadata: serde_json::Value::Object(Default::default()),
        };

        match self.store.charge_usage_event(tenant_id, event.id, &debit).await {
            Ok((charged, ledger)) => {
                info!(
                    %tenant_id,
                    event_id = %charged.id,
                    ledger_transaction_id = %ledger.id,
                    amount = %ledger.amount,
                    balance_after = %ledger.balance_after,
                    "usage event charged"
                );
                Ok((charged, ledger))
            }
            // A concurrent void is terminal, not a failed attempt.
            Err(e @ BillingError::VoidedUsageEvent { .. }) => Err(e),
            Err(e) => {
                warn!(
                    %tenant_id,
                    event_id = %event.id,
                    error = %e,
                    "charge failed; marking event failed"
                );
                // Recorded outside the rolled-back transaction so the
                // failure survives it.
                if let Err(mark_err) = self
                    .store
                    .mark_usage_event_failed(tenant_id, event.id, &e.to_string())
                    .await
                {
                    warn!(
                        %tenant_id,
                        event_id = %event.id,
                        error = %mark_err,
                        "failed to record charge failure"
                    );
                }
                Err(e)
            }
        }
    }

    // -- Wallet -------------------------------------------------------------

    /// Atomically credit a tenant's wallet (top-up, refund, adjustment).
    ///
    /// Creates the wallet if the tenant has none.
    pub async fn credit_wallet(&self, mut mutation: WalletMutation) -> Result<LedgerTransaction> {
        if mutation.currency.is_empty() {
            mutation.currency = self.currency.clone();
        }
        let ledger = self.store.credit_wallet(&mutation).await?;
        info!(
            tenant_id = %mutation.tenant_id,
            ledger_transaction_id = %ledger.id,
            amount = %ledger.amount,
            balance_after = %ledger.balance_after,
            "wallet credited"
        );
        Ok(ledger)
    }

    /// Atomically debit a tenant's wallet. Administrative primitive; usage
    /// charges go through [`Self::charge_usage_event`].
    pub async fn debit_wallet(&self, mutation: WalletMutation) -> Result<LedgerTransaction> {
        let ledger = self.store.debit_wallet(&mutation).await?;
        info!(
            tenant_id = %mutation.tenant_id,
            ledger_transaction_id = %ledger.id,
            amount = %ledger.amount,
            balance_after = %ledger.balance_after,
            "wallet debited"
        );
        Ok(ledger)
    }

    /// Read a tenant's balance.
    ///
    /// A tenant that was never funded reads as an empty active wallet in
    /// the service's default currency (the wallet row itself is created
    /// lazily by the first credit).
    pub async fn get_wallet_balance(&self, tenant_id: TenantId) -> Result<BalanceSnapshot> {
        let wallet = self.store.get_wallet(tenant_id).await?;
        Ok(match wallet {
            Some(wallet) => snapshot(&wallet),
            None => BalanceSnapshot {
                current_balance: Decimal::ZERO,
                reserved_balance: Decimal::ZERO,
                available_balance: Decimal::ZERO,
                currency: self.currency.clone(),
                status: WalletStatus::Active,
            },
        })
    }

    /// List ledger transactions, newest first.
    pub async fn list_ledger_transactions(
        &self,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerTransaction>> {
        self.store.list_ledger_transactions(query).await
    }

    /// Health check for the underlying store.
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

fn snapshot(wallet: &Wallet) -> BalanceSnapshot {
    BalanceSnapshot {
        current_balance: wallet.current_balance,
        reserved_balance: wallet.reserved_balance,
        available_balance: wallet.available_balance(),
        currency: wallet.currency.clone(),
        status: wallet.status,
    }
}
