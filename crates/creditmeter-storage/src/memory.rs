//! In-memory storage backend for testing.
//!
//! Stores all data behind a single async mutex. Holding the lock for the
//! whole of each mutation gives the same serialization the SQL backends get
//! from the wallet row lock; queries are linear scans. Not intended for
//! production use.

use async_trait::async_trait;
use chrono::Utc;
use creditmeter_core::{
    BillingError, LedgerQuery, LedgerStore, LedgerTransaction, PriceLookup, PricingEntry, Result,
    TenantId, UsageEvent, UsageEventQuery, UsageEventStatus, Wallet, WalletMutation, WalletStatus,
    WILDCARD_MODEL,
};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    wallets: Vec<Wallet>,
    ledger: Vec<LedgerTransaction>,
    events: Vec<UsageEvent>,
    pricing: Vec<PricingEntry>,
}

/// Direction of a wallet mutation.
#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Credit,
    Debit,
}

/// In-memory [`LedgerStore`] for tests.
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
}

impl InMemoryLedgerStore {
    /// Create a new, empty in-memory store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Apply a credit or debit against the locked state.
    fn apply_mutation(
        state: &mut State,
        mutation: &WalletMutation,
        direction: Direction,
    ) -> Result<LedgerTransaction> {
        // Zero is allowed: a fully-discounted usage event still charges,
        // appending a zero-amount ledger row.
        if mutation.amount < Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "mutation amount must not be negative, got {}",
                mutation.amount
            )));
        }

        if let Some(existing) = state
            .ledger
            .iter()
            .find(|l| l.tenant_id == mutation.tenant_id && l.idempotency_key == mutation.idempotency_key)
        {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let wallet_idx = match state
            .wallets
            .iter()
            .position(|w| w.tenant_id == mutation.tenant_id)
        {
            Some(idx) => idx,
            None if direction == Direction::Credit => {
                state.wallets.push(Wallet {
                    id: Uuid::new_v4(),
                    tenant_id: mutation.tenant_id,
                    current_balance: Decimal::ZERO,
                    reserved_balance: Decimal::ZERO,
                    currency: mutation.currency.clone(),
                    status: WalletStatus::Active,
                    created_at: now,
                    updated_at: now,
                });
                state.wallets.len() - 1
            }
            None => {
                return Err(BillingError::WalletNotFound {
                    tenant_id: mutation.tenant_id,
                })
            }
        };

        let wallet = &state.wallets[wallet_idx];
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

        let wallet = &mut state.wallets[wallet_idx];
        wallet.current_balance = balance_after;
        wallet.updated_at = now;
        state.ledger.push(ledger.clone());

        Ok(ledger)
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_wallet(&self, tenant_id: TenantId) -> Result<Option<Wallet>> {
        let state = self.state.lock().await;
        Ok(state.wallets.iter().find(|w| w.tenant_id == tenant_id).cloned())
    }

    async fn credit_wallet(&self, mutation: &WalletMutation) -> Result<LedgerTransaction> {
        let mut state = self.state.lock().await;
        Self::apply_mutation(&mut state, mutation, Direction::Credit)
    }

    async fn debit_wallet(&self, mutation: &WalletMutation) -> Result<LedgerTransaction> {
        let mut state = self.state.lock().await;
        Self::apply_mutation(&mut state, mutation, Direction::Debit)
    }

    async fn get_ledger_transaction(
        &self,
        tenant_id: TenantId,
        id: Uuid,
    ) -> Result<Option<LedgerTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .find(|l| l.tenant_id == tenant_id && l.id == id)
            .cloned())
    }

    async fn find_ledger_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .find(|l| l.tenant_id == tenant_id && l.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn list_ledger_transactions(
        &self,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerTransaction>> {
        let state = self.state.lock().await;
        let mut results: Vec<_> = state
            .ledger
            .iter()
            .filter(|l| {
                l.tenant_id == query.tenant_id
                    && query.tx_type.map_or(true, |t| l.tx_type == t)
                    && query
                        .reference_type
                        .as_ref()
                        .map_or(true, |r| l.reference_type.as_ref() == Some(r))
                    && query.start_time.map_or(true, |s| l.created_at >= s)
                    && query.end_time.map_or(true, |e| l.created_at <= e)
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        paginate(&mut results, query.offset, query.limit);
        Ok(results)
    }

    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<UsageEvent> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .events
            .iter()
            .find(|e| e.tenant_id == event.tenant_id && e.idempotency_key == event.idempotency_key)
        {
            return Ok(existing.clone());
        }
        state.events.push(event.clone());
        Ok(event.clone())
    }

    async fn get_usage_event(&self, tenant_id: TenantId, id: Uuid) -> Result<Option<UsageEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.id == id)
            .cloned())
    }

    async fn find_usage_event_by_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<UsageEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn charge_usage_event(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
        debit: &WalletMutation,
    ) -> Result<(UsageEvent, LedgerTransaction)> {
        let mut state = self.state.lock().await;

        let event = state
            .events
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.id == event_id)
            .cloned()
            .ok_or_else(|| BillingError::Storage(format!("usage event {event_id} not found")))?;

        match event.status {
            UsageEventStatus::Charged => {
                let ledger_id = event.ledger_transaction_id.ok_or_else(|| {
                    BillingError::Storage(format!(
                        "charged event {event_id} has no ledger transaction"
                    ))
                })?;
                let ledger = state
                    .ledger
                    .iter()
                    .find(|l| l.id == ledger_id)
                    .cloned()
                    .ok_or_else(|| {
                        BillingError::Storage("charge transaction not found".to_string())
                    })?;
                return Ok((event, ledger));
            }
            UsageEventStatus::Voided => {
                return Err(BillingError::VoidedUsageEvent { event_id });
            }
            UsageEventStatus::Pending | UsageEventStatus::Failed => {}
        }

        // apply_mutation short-circuits on a previously-persisted key, so a
        // crash-interrupted retry reuses the original debit.
        let ledger = Self::apply_mutation(&mut state, debit, Direction::Debit)?;

        let now = Utc::now();
        let stored = state
            .events
            .iter_mut()
            .find(|e| e.tenant_id == tenant_id && e.id == event_id)
            .expect("event disappeared while state lock was held");
        stored.status = UsageEventStatus::Charged;
        stored.ledger_transaction_id = Some(ledger.id);
        stored.error_message = None;
        stored.updated_at = now;

        Ok((stored.clone(), ledger))
    }

    async fn mark_usage_event_failed(
        &self,
        tenant_id: TenantId,
        event_id: Uuid,
        error_message: &str,
    ) -> Result<UsageEvent> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.tenant_id == tenant_id && e.id == event_id)
            .ok_or_else(|| BillingError::Storage(format!("usage event {event_id} not found")))?;

        match event.status {
            UsageEventStatus::Pending | UsageEventStatus::Failed => {
                event.status = UsageEventStatus::Failed;
                event.error_message = Some(error_message.to_string());
                event.retry_count += 1;
                event.updated_at = Utc::now();
                Ok(event.clone())
            }
            status => Err(BillingError::Validation(format!(
                "cannot mark {status} event {event_id} as failed"
            ))),
        }
    }

    async fn void_usage_event(&self, tenant_id: TenantId, event_id: Uuid) -> Result<UsageEvent> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.tenant_id == tenant_id && e.id == event_id)
            .ok_or_else(|| BillingError::Storage(format!("usage event {event_id} not found")))?;

        match event.status {
            UsageEventStatus::Pending | UsageEventStatus::Failed => {
                event.status = UsageEventStatus::Voided;
                event.updated_at = Utc::now();
                Ok(event.clone())
            }
            UsageEventStatus::Voided => Ok(event.clone()),
            status => Err(BillingError::Validation(format!(
                "cannot void {status} event {event_id}"
            ))),
        }
    }

    async fn list_usage_events(&self, query: &UsageEventQuery) -> Result<Vec<UsageEvent>> {
        let state = self.state.lock().await;
        let mut results: Vec<_> = state
            .events
            .iter()
            .filter(|e| {
                e.tenant_id == query.tenant_id
                    && query.status.map_or(true, |s| e.status == s)
                    && query
                        .feature_key
                        .as_ref()
                        .map_or(true, |f| &e.feature_key == f)
                    && query.start_time.map_or(true, |s| e.created_at >= s)
                    && query.end_time.map_or(true, |t| e.created_at <= t)
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        paginate(&mut results, query.offset, query.limit);
        Ok(results)
    }

    async fn upsert_pricing_entry(&self, entry: &PricingEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pricing.retain(|p| p.id != entry.id);
        state.pricing.push(entry.clone());
        Ok(())
    }

    async fn find_pricing_candidates(&self, lookup: &PriceLookup) -> Result<Vec<PricingEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .pricing
            .iter()
            .filter(|p| {
                p.active
                    && p.category == lookup.category
                    && p.provider == lookup.provider
                    && p.unit == lookup.unit
                    && (p.model == lookup.model || p.model == WILDCARD_MODEL)
                    && (p.tenant_id.is_none() || p.tenant_id == Some(lookup.tenant_id))
            })
            .cloned()
            .collect())
    }

    async fn list_pricing(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Vec<PricingEntry>> {
        let state = self.state.lock().await;
        let mut results: Vec<_> = state
            .pricing
            .iter()
            .filter(|p| {
                p.active
                    && (p.tenant_id.is_none() || p.tenant_id == Some(tenant_id))
                    && category.map_or(true, |c| p.category == c)
                    && provider.map_or(true, |pr| p.provider == pr)
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            (&a.category, &a.provider, &a.model)
                .cmp(&(&b.category, &b.provider, &b.model))
                .then(b.effective_from.cmp(&a.effective_from))
        });
        Ok(results)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn paginate<T>(results: &mut Vec<T>, offset: Option<u32>, limit: Option<u32>) {
    if let Some(offset) = offset {
        let offset = offset as usize;
        if offset < results.len() {
            *results = results.split_off(offset);
        } else {
            results.clear();
        }
    }
    if let Some(limit) = limit {
        results.truncate(limit as usize);
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
    use std::sync::Arc;

    fn topup(tenant: TenantId, amount: Decimal, key: &str) -> WalletMutation {
        WalletMutation::new(tenant, TransactionType::Topup, amount, key)
    }

    fn debit(tenant: TenantId, amount: Decimal, key: &str) -> WalletMutation {
        WalletMutation::new(tenant, TransactionType::Debit, amount, key)
    }

    #[tokio::test]
    async fn credit_then_debit() {
        let store = InMemoryLedgerStore::new();
        let tenant = TenantId::new();

        store.credit_wallet(&topup(tenant, dec!(100), "t1")).await.unwrap();
        let ledger = store.debit_wallet(&debit(tenant, dec!(40), "d1")).await.unwrap();

        assert_eq!(ledger.amount, dec!(-40));
        assert_eq!(ledger.balance_before, dec!(100));
        assert_eq!(ledger.balance_after, dec!(60));

        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(60));
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let store = InMemoryLedgerStore::new();
        let t1 = TenantId::new();
        let t2 = TenantId::new();

        store.credit_wallet(&topup(t1, dec!(10), "t1")).await.unwrap();
        store.credit_wallet(&topup(t2, dec!(20), "t1")).await.unwrap();

        assert_eq!(
            store.get_wallet(t1).await.unwrap().unwrap().current_balance,
            dec!(10)
        );
        assert_eq!(
            store.get_wallet(t2).await.unwrap().unwrap().current_balance,
            dec!(20)
        );

        // Same idempotency key under different tenants is two transactions
        let ledger = store
            .list_ledger_transactions(&LedgerQuery::new(t1))
            .await
            .unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_credits_create_one_wallet() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant = TenantId::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .credit_wallet(&WalletMutation::new(
                        tenant,
                        TransactionType::Topup,
                        dec!(1),
                        format!("topup_{i}"),
                    ))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let state = store.state.lock().await;
        assert_eq!(
            state.wallets.iter().filter(|w| w.tenant_id == tenant).count(),
            1
        );
        assert_eq!(
            state.wallets.iter().find(|w| w.tenant_id == tenant).unwrap().current_balance,
            dec!(8)
        );
    }

    #[tokio::test]
    async fn concurrent_debits_never_corrupt_balance() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let tenant = TenantId::new();
        store.credit_wallet(&topup(tenant, dec!(5), "seed")).await.unwrap();

        // 10 concurrent debits of 1 against a balance of 5: exactly 5 must
        // succeed and the rest fail with InsufficientBalance.
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .debit_wallet(&WalletMutation::new(
                        tenant,
                        TransactionType::Debit,
                        dec!(1),
                        format!("debit_{i}"),
                    ))
                    .await
            }));
        }

        let mut ok = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(BillingError::InsufficientBalance { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(ok, 5);
        assert_eq!(insufficient, 5);

        let wallet = store.get_wallet(tenant).await.unwrap().unwrap();
        assert_eq!(wallet.current_balance, dec!(0));
    }

    #[tokio::test]
    async fn health_check_passes() {
        let store = InMemoryLedgerStore::new();
        store.health_check().await.unwrap();
    }
}
