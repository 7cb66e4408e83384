//! Checkout request payload shaping and fee arithmetic

use serde_json::{Map, Value};
use storefront_shared::CheckoutMode;

/// Fields Stripe accepts on a subscription-mode session
const SUBSCRIPTION_FIELDS: &[&str] = &[
    "line_items",
    "customer",
    "customer_email",
    "automatic_tax",
    "allow_promotion_codes",
    "success_url",
    "cancel_url",
    "custom_text",
    "subscription_data",
    "client_reference_id",
    "metadata",
];

/// Fields Stripe accepts on a payment-mode session
const PAYMENT_FIELDS: &[&str] = &[
    "line_items",
    "customer",
    "customer_email",
    "customer_creation",
    "customer_update",
    "automatic_tax",
    "allow_promotion_codes",
    "success_url",
    "cancel_url",
    "custom_text",
    "payment_intent_data",
    "client_reference_id",
    "metadata",
];

fn allowed_fields(mode: CheckoutMode) -> &'static [&'static str] {
    match mode {
        CheckoutMode::Subscription => SUBSCRIPTION_FIELDS,
        CheckoutMode::Payment | CheckoutMode::Setup => PAYMENT_FIELDS,
    }
}

/// Filter a field bag down to what `mode` allows and drop null placeholders.
pub fn build_checkout_payload(fields: Map<String, Value>, mode: CheckoutMode) -> Value {
    let allowed = allowed_fields(mode);
    let mut payload = Map::new();
    payload.insert("mode".to_string(), Value::String(mode.as_str().to_string()));

    for (key, value) in fields {
        if key == "mode" {
            continue;
        }
        if allowed.contains(&key.as_str()) {
            payload.insert(key, value);
        } else {
            tracing::debug!(field = %key, mode = %mode, "Dropping checkout field not allowed in mode");
        }
    }

    clean_undefined(Value::Object(payload))
}

/// Recursively remove nulls from objects and arrays.
pub fn clean_undefined(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, clean_undefined(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(clean_undefined)
                .collect(),
        ),
        other => other,
    }
}

/// Platform fee in cents. `percent` ≤ 1 is read as a fraction.
pub fn compute_platform_fee(amount_cents: i64, percent: f64) -> i64 {
    let fraction = if percent <= 1.0 { percent } else { percent / 100.0 };
    (amount_cents as f64 * fraction).round() as i64
}

/// Fee as the whole percentage Stripe expects for `application_fee_percent`.
pub fn to_stripe_percent(percent: f64) -> f64 {
    let whole = if percent <= 1.0 { percent * 100.0 } else { percent };
    (whole * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_subscription_mode_drops_payment_fields() {
        let payload = build_checkout_payload(
            fields(json!({
                "line_items": [{"price": "price_1", "quantity": 1}],
                "customer_creation": "always",
                "payment_intent_data": {"application_fee_amount": 100}
            })),
            CheckoutMode::Subscription,
        );

        assert_eq!(
            payload,
            json!({
                "mode": "subscription",
                "line_items": [{"price": "price_1", "quantity": 1}]
            })
        );
    }

    #[test]
    fn test_payment_mode_drops_subscription_data() {
        let payload = build_checkout_payload(
            fields(json!({
                "line_items": [],
                "customer_creation": "always",
                "subscription_data": {"metadata": {"userId": "u1"}}
            })),
            CheckoutMode::Payment,
        );

        assert_eq!(payload["mode"], "payment");
        assert_eq!(payload["customer_creation"], "always");
        assert!(payload.get("subscription_data").is_none());
    }

    #[test]
    fn test_clean_undefined_nested() {
        assert_eq!(
            clean_undefined(json!({"a": 1, "b": null, "c": {"d": null, "e": 2}})),
            json!({"a": 1, "c": {"e": 2}})
        );
    }

    #[test]
    fn test_clean_undefined_arrays() {
        assert_eq!(
            clean_undefined(json!({"items": [null, {"price": "p", "tax": null}, 3]})),
            json!({"items": [{"price": "p"}, 3]})
        );
    }

    #[test]
    fn test_platform_fee() {
        assert_eq!(compute_platform_fee(1000, 0.3), 300);
        assert_eq!(compute_platform_fee(1000, 30.0), 300);
        assert_eq!(compute_platform_fee(999, 15.0), 150);
        assert_eq!(compute_platform_fee(1000, 0.0), 0);
    }

    #[test]
    fn test_stripe_percent() {
        assert_eq!(to_stripe_percent(0.3), 30.0);
        assert_eq!(to_stripe_percent(0.125), 12.5);
        assert_eq!(to_stripe_percent(30.0), 30.0);
    }
}
