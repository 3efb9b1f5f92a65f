//! Pure pricing of usage items.
//!
//! [`quote`] reads the pricing catalog but writes nothing; it is
//! deterministic for a given input and pricing snapshot, so callers may
//! invoke it repeatedly for display purposes. A quote is all-or-nothing:
//! the first unpriceable item aborts the whole call.

use crate::catalog::PricingCatalog;
use chrono::{DateTime, Utc};
use creditmeter_core::{
    BillingError, PricedItem, Quote, Result, TenantId, UsageItem, COST_SCALE,
};
use rust_decimal::{Decimal, RoundingStrategy};

/// Round a cost to [`COST_SCALE`] decimal places, midpoints away from zero.
#[must_use]
pub fn round_cost(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Validate usage items at the boundary, before any pricing lookup.
///
/// Rejects an empty list, empty identifying fields, and non-positive
/// quantities with [`BillingError::Validation`].
pub fn validate_items(items: &[UsageItem]) -> Result<()> {
    if items.is_empty() {
        return Err(BillingError::Validation("usage items must not be empty".into()));
    }
    for (index, item) in items.iter().enumerate() {
        for (field, value) in [
            ("category", &item.category),
            ("provider", &item.provider),
            ("model", &item.model),
            ("unit", &item.unit),
        ] {
            if value.trim().is_empty() {
                return Err(BillingError::Validation(format!(
                    "item {index}: {field} must not be empty"
                )));
            }
        }
        if item.quantity <= Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "item {index}: quantity must be positive, got {}",
                item.quantity
            )));
        }
    }
    Ok(())
}

/// Price `items` for `tenant_id` against the catalog as of `at`.
pub async fn quote(
    catalog: &PricingCatalog,
    tenant_id: TenantId,
    items: &[UsageItem],
    at: DateTime<Utc>,
) -> Result<Quote> {
    validate_items(items)?;

    let mut priced = Vec::with_capacity(items.len());
    let mut total_quantity = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    let mut currency: Option<String> = None;

    for item in items {
        let entry = catalog
            .resolve_price(
                tenant_id,
                &item.category,
                &item.provider,
                &item.model,
                &item.unit,
                at,
            )
            .await?;

        match currency {
            None => currency = Some(entry.currency.clone()),
            Some(ref c) if *c != entry.currency => {
                return Err(BillingError::Validation(format!(
                    "mixed currencies in quote: {c} and {}",
                    entry.currency
                )));
            }
            Some(_) => {}
        }

        let cost = round_cost(item.quantity * entry.unit_price);
        total_quantity += item.quantity;
        total_cost += cost;

        priced.push(PricedItem {
            category: item.category.clone(),
            provider: item.provider.clone(),
            model: item.model.clone(),
            unit: item.unit.clone(),
            quantity: item.quantity,
            unit_price: entry.unit_price,
            cost,
            description: item.description.clone(),
        });
    }

    Ok(Quote {
        items: priced,
        total_quantity,
        total_cost,
        // validate_items rejects empty input, so at least one item priced
        currency: currency.expect("quote priced at least one item"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_to_six_decimal_places() {
        assert_eq!(round_cost(dec!(0.0000001)), dec!(0.000000));
        assert_eq!(round_cost(dec!(0.0000005)), dec!(0.000001));
        assert_eq!(round_cost(dec!(0.006)), dec!(0.006));
        assert_eq!(round_cost(dec!(1.2345678)), dec!(1.234568));
    }

    #[test]
    fn scenario_a_cost() {
        // 60 seconds at $0.0001/s
        assert_eq!(round_cost(dec!(60) * dec!(0.0001)), dec!(0.006));
    }

    #[test]
    fn validation_rejects_bad_items() {
        assert!(validate_items(&[]).is_err());

        let mut item = UsageItem::new("stt", "openai", "whisper-1", "second", dec!(60));
        assert!(validate_items(std::slice::from_ref(&item)).is_ok());

        item.provider = String::new();
        assert!(validate_items(std::slice::from_ref(&item)).is_err());

        let zero_qty = UsageItem::new("stt", "openai", "whisper-1", "second", dec!(0));
        assert!(validate_items(&[zero_qty]).is_err());

        let negative = UsageItem::new("stt", "openai", "whisper-1", "second", dec!(-1));
        assert!(validate_items(&[negative]).is_err());
    }
}
