//! Tenant-override-aware price resolution.
//!
//! A lookup resolves against four tiers, first match wins:
//!
//! 1. tenant-specific entry with an exact model match
//! 2. tenant-specific wildcard-model entry
//! 3. global entry with an exact model match
//! 4. global wildcard-model entry
//!
//! Within a tier the entry with the most recent `effective_from` that is
//! still in effect wins. A lookup with no match is a hard
//! [`PricingNotFound`](BillingError::PricingNotFound) — there is no implicit
//! zero-cost default.

use chrono::{DateTime, Utc};
use creditmeter_core::{
    BillingError, LedgerStore, PriceLookup, PricingEntry, Result, TenantId, WILDCARD_MODEL,
};
use std::sync::Arc;
use tracing::debug;

/// Resolves unit prices from the persisted catalog.
#[derive(Clone)]
pub struct PricingCatalog {
    store: Arc<dyn LedgerStore>,
}

impl PricingCatalog {
    /// Create a catalog over the given store.
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Resolve the unit price for `(category, provider, model, unit)` as
    /// seen by `tenant_id` at time `at`.
    pub async fn resolve_price(
        &self,
        tenant_id: TenantId,
        category: &str,
        provider: &str,
        model: &str,
        unit: &str,
        at: DateTime<Utc>,
    ) -> Result<PricingEntry> {
        let lookup = PriceLookup {
            tenant_id,
            category: category.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            unit: unit.to_string(),
            at,
        };

        let candidates = self.store.find_pricing_candidates(&lookup).await?;
        let entry = select_entry(&candidates, &lookup).cloned();

        match entry {
            Some(entry) => {
                debug!(
                    %tenant_id,
                    category,
                    provider,
                    model,
                    unit,
                    unit_price = %entry.unit_price,
                    tenant_override = entry.tenant_id.is_some(),
                    "resolved price"
                );
                Ok(entry)
            }
            None => Err(BillingError::PricingNotFound {
                category: lookup.category,
                provider: lookup.provider,
                model: lookup.model,
                unit: lookup.unit,
            }),
        }
    }

    /// List the union of tenant and global active entries, for display and
    /// audit. No selection logic.
    pub async fn list_pricing(
        &self,
        tenant_id: TenantId,
        category: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Vec<PricingEntry>> {
        self.store.list_pricing(tenant_id, category, provider).await
    }

    /// Insert or replace a catalog entry.
    pub async fn upsert_entry(&self, entry: &PricingEntry) -> Result<()> {
        self.store.upsert_pricing_entry(entry).await
    }
}

/// Priority tier of an entry for a lookup; lower wins. `None` when the
/// entry does not apply to the lookup at all.
fn tier(entry: &PricingEntry, lookup: &PriceLookup) -> Option<u8> {
    let tenant_specific = match entry.tenant_id {
        Some(tenant) if tenant == lookup.tenant_id => true,
        Some(_) => return None,
        None => false,
    };
    let exact_model = if entry.model == lookup.model {
        true
    } else if entry.model == WILDCARD_MODEL {
        false
    } else {
        return None;
    };

    Some(match (tenant_specific, exact_model) {
        (true, true) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (false, false) => 3,
    })
}

/// Pick the winning entry among candidates: lowest tier, then the most
/// recent `effective_from` that is in effect at the lookup time.
fn select_entry<'a>(candidates: &'a [PricingEntry], lookup: &PriceLookup) -> Option<&'a PricingEntry> {
    candidates
        .iter()
        .filter(|entry| entry.in_effect_at(lookup.at))
        .filter_map(|entry| tier(entry, lookup).map(|t| (t, entry)))
        .min_by(|(tier_a, entry_a), (tier_b, entry_b)| {
            tier_a
                .cmp(tier_b)
                .then(entry_b.effective_from.cmp(&entry_a.effective_from))
        })
        .map(|(_, entry)| entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn entry(
        tenant_id: Option<TenantId>,
        model: &str,
        price: Decimal,
        effective_from: DateTime<Utc>,
    ) -> PricingEntry {
        PricingEntry {
            id: Uuid::new_v4(),
            tenant_id,
            category: "stt".into(),
            provider: "openai".into(),
            model: model.into(),
            unit: "second".into(),
            unit_price: price,
            currency: "USD".into(),
            effective_from,
            effective_to: None,
            active: true,
            created_at: effective_from,
        }
    }

    fn lookup(tenant_id: TenantId, at: DateTime<Utc>) -> PriceLookup {
        PriceLookup {
            tenant_id,
            category: "stt".into(),
            provider: "openai".into(),
            model: "whisper-1".into(),
            unit: "second".into(),
            at,
        }
    }

    #[test]
    fn tenant_exact_beats_all_other_tiers() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);

        let candidates = vec![
            entry(None, WILDCARD_MODEL, dec!(0.0004), old),
            entry(None, "whisper-1", dec!(0.0003), old),
            entry(Some(tenant), WILDCARD_MODEL, dec!(0.0002), old),
            entry(Some(tenant), "whisper-1", dec!(0.0001), old),
        ];

        let winner = select_entry(&candidates, &lookup(tenant, now)).unwrap();
        assert_eq!(winner.unit_price, dec!(0.0001));
    }

    #[test]
    fn tenant_wildcard_beats_global_exact() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);

        let candidates = vec![
            entry(None, "whisper-1", dec!(0.0003), old),
            entry(Some(tenant), WILDCARD_MODEL, dec!(0.0002), old),
        ];

        let winner = select_entry(&candidates, &lookup(tenant, now)).unwrap();
        assert_eq!(winner.unit_price, dec!(0.0002));
    }

    #[test]
    fn most_recent_effective_from_wins_within_tier() {
        let tenant = TenantId::new();
        let now = Utc::now();

        let candidates = vec![
            entry(None, "whisper-1", dec!(0.0003), now - chrono::Duration::days(30)),
            entry(None, "whisper-1", dec!(0.0002), now - chrono::Duration::days(1)),
            // Not yet effective — must not be picked
            entry(None, "whisper-1", dec!(0.0001), now + chrono::Duration::days(1)),
        ];

        let winner = select_entry(&candidates, &lookup(tenant, now)).unwrap();
        assert_eq!(winner.unit_price, dec!(0.0002));
    }

    #[test]
    fn expired_and_inactive_entries_are_skipped() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);

        let mut expired = entry(None, "whisper-1", dec!(0.0001), old);
        expired.effective_to = Some(now - chrono::Duration::days(1));
        let mut inactive = entry(None, "whisper-1", dec!(0.0002), old);
        inactive.active = false;

        assert!(select_entry(&[expired, inactive], &lookup(tenant, now)).is_none());
    }

    #[test]
    fn other_tenants_entries_never_apply() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);

        let candidates = vec![entry(Some(TenantId::new()), "whisper-1", dec!(0.0001), old)];
        assert!(select_entry(&candidates, &lookup(tenant, now)).is_none());
    }

    #[test]
    fn unrelated_model_never_applies() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let candidates = vec![entry(None, "gpt-4o", dec!(0.0001), now - chrono::Duration::days(1))];
        assert!(select_entry(&candidates, &lookup(tenant, now)).is_none());
    }
}
