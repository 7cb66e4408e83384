//! Billing history: provider invoices and the local audit log

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::events::{BillingEvent, BillingEventLogger};
use crate::provider::{Invoice, PaymentProvider, SubscriptionQuery};

/// Invoices fetched per request
const INVOICE_PAGE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceSummary {
    pub id: String,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::timestamp")]
    pub date: OffsetDateTime,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf: Option<String>,
}

impl From<Invoice> for InvoiceSummary {
    fn from(invoice: Invoice) -> Self {
        Self {
            id: invoice.id,
            amount_cents: invoice.total.unwrap_or(0),
            currency: invoice.currency.unwrap_or_else(|| "usd".to_string()),
            date: OffsetDateTime::from_unix_timestamp(invoice.created)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            status: invoice.status.unwrap_or_else(|| "unknown".to_string()),
            pdf: invoice.invoice_pdf.filter(|p| !p.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceHistory {
    pub invoices: Vec<InvoiceSummary>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::timestamp::option"
    )]
    pub next_payment_date: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct HistoryService {
    provider: Arc<dyn PaymentProvider>,
    events: BillingEventLogger,
}

impl HistoryService {
    pub fn new(provider: Arc<dyn PaymentProvider>, events: BillingEventLogger) -> Self {
        Self { provider, events }
    }

    /// Up to 100 invoices, oldest first, plus the active subscription's next charge date
    pub async fn list_invoices(&self, customer_id: &str) -> BillingResult<InvoiceHistory> {
        let page = self
            .provider
            .list_invoices(customer_id, INVOICE_PAGE)
            .await?;
        let mut invoices: Vec<InvoiceSummary> =
            page.data.into_iter().map(InvoiceSummary::from).collect();
        invoices.sort_by_key(|invoice| invoice.date);

        let active = self
            .provider
            .list_subscriptions(&SubscriptionQuery {
                customer: Some(customer_id.to_string()),
                status: Some("active".to_string()),
                limit: Some(1),
                ..Default::default()
            })
            .await?;
        let next_payment_date = active.data.first().and_then(|sub| sub.period_end());

        Ok(InvoiceHistory {
            invoices,
            next_payment_date,
        })
    }

    /// Most recent audit events for a user, newest first
    pub async fn list_billing_events_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.events.events_for_user(user_id, limit.clamp(1, 500)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BillingEventBuilder, BillingEventType};
    use crate::provider::Expandable;
    use crate::store::InMemoryBillingStore;
    use crate::testing::{price, subscription, MockProvider};
    use storefront_shared::SubscriptionStatus;

    fn invoice(id: &str, created: i64, status: Option<&str>) -> Invoice {
        Invoice {
            id: id.into(),
            customer: Some(Expandable::Id("cus_1".into())),
            subscription: None,
            total: Some(999),
            currency: None,
            status: status.map(str::to_string),
            created,
            invoice_pdf: Some(format!("https://pay.stripe.test/{}.pdf", id)),
        }
    }

    #[tokio::test]
    async fn test_invoices_oldest_first_with_defaults() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        provider.add_invoice(invoice("in_2", 1_700_100_000, Some("paid"))).await;
        provider.add_invoice(invoice("in_1", 1_700_000_000, None)).await;
        provider
            .add_subscription(subscription(
                "sub_1",
                "cus_1",
                SubscriptionStatus::Active,
                &[("si_1", price("price_gold", 999, Some("month")))],
            ))
            .await;
        let history = HistoryService::new(provider.clone(), BillingEventLogger::new(store));

        let result = history.list_invoices("cus_1").await.unwrap();
        let ids: Vec<&str> = result.invoices.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["in_1", "in_2"]);
        assert_eq!(result.invoices[0].status, "unknown");
        assert_eq!(result.invoices[0].currency, "usd");
        assert_eq!(
            result.next_payment_date.map(|d| d.unix_timestamp()),
            Some(4_102_444_800)
        );

        let query = &provider.subscription_queries().await[0];
        assert_eq!(query.status.as_deref(), Some("active"));
        assert_eq!(query.limit, Some(1));
    }

    #[tokio::test]
    async fn test_no_active_subscription_has_no_next_date() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        let history = HistoryService::new(provider, BillingEventLogger::new(store));

        let result = history.list_invoices("cus_1").await.unwrap();
        assert!(result.invoices.is_empty());
        assert!(result.next_payment_date.is_none());
    }

    #[tokio::test]
    async fn test_billing_events_newest_first() {
        let store = Arc::new(InMemoryBillingStore::new());
        let events = BillingEventLogger::new(store.clone());
        for (i, kind) in [BillingEventType::CheckoutCompleted, BillingEventType::InvoicePaid]
            .into_iter()
            .enumerate()
        {
            events
                .log_event(
                    BillingEventBuilder::new("u1", kind).occurred_at(
                        OffsetDateTime::from_unix_timestamp(1_700_000_000 + i as i64).unwrap(),
                    ),
                )
                .await
                .unwrap();
        }
        let history = HistoryService::new(Arc::new(MockProvider::new()), events);

        let listed = history.list_billing_events_for_user("u1", 10).await.unwrap();
        assert_eq!(listed[0].event_type, "invoice.paid");
        assert_eq!(listed.len(), 2);
    }
}
