//! Creator subscription metrics
//!
//! Subscriber counts come straight from the provider. Revenue figures are
//! monthly estimates: unit amount times active subscribers, with the creator
//! side net of the platform fee.

use std::sync::Arc;

use serde::Serialize;

use crate::client::StripeConfig;
use crate::error::{best_effort, BillingResult};
use crate::payload::to_stripe_percent;
use crate::prices::{PriceOwner, PriceResolver};
use crate::provider::{PaymentProvider, SubscriptionQuery};
use crate::store::CatalogStore;

/// Subscriptions fetched per list request
const SUBSCRIPTION_PAGE: u32 = 100;

/// Creator all-access price and its subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllAccessMetrics {
    pub price_id: Option<String>,
    pub unit_amount: Option<i64>,
    pub active: u64,
    pub monthly_estimate_gross: Option<i64>,
    pub monthly_estimate_creator: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetrics {
    pub app_id: String,
    pub price_id: Option<String>,
    pub unit_amount: Option<i64>,
    pub active: u64,
    pub creator_monthly: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsTotals {
    pub monthly_estimate_gross: i64,
    pub monthly_estimate_creator: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatorSubscriptionMetrics {
    pub all_access: AllAccessMetrics,
    pub apps: Vec<AppMetrics>,
    pub totals: MetricsTotals,
}

/// Creator share of a gross amount, rounded to the nearest cent
fn creator_share(gross_cents: i64, platform_fee_percent: f64) -> i64 {
    let share = 1.0 - to_stripe_percent(platform_fee_percent) / 100.0;
    (gross_cents as f64 * share).round() as i64
}

#[derive(Clone)]
pub struct MetricsService {
    config: Arc<StripeConfig>,
    provider: Arc<dyn PaymentProvider>,
    prices: Arc<PriceResolver>,
    catalog: Arc<dyn CatalogStore>,
}

impl MetricsService {
    pub fn new(
        config: Arc<StripeConfig>,
        provider: Arc<dyn PaymentProvider>,
        prices: Arc<PriceResolver>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            config,
            provider,
            prices,
            catalog,
        }
    }

    /// Number of active subscriptions on a price, following every page
    pub async fn count_active_subscriptions_for_price(&self, price_id: &str) -> BillingResult<u64> {
        if price_id.trim().is_empty() {
            return Ok(0);
        }

        let mut total = 0_u64;
        let mut starting_after: Option<String> = None;
        loop {
            let page = self
                .provider
                .list_subscriptions(&SubscriptionQuery {
                    price: Some(price_id.to_string()),
                    status: Some("active".to_string()),
                    limit: Some(SUBSCRIPTION_PAGE),
                    starting_after: starting_after.take(),
                    ..Default::default()
                })
                .await?;
            total += page.data.len() as u64;

            match page.data.last() {
                Some(last) if page.has_more => starting_after = Some(last.id.clone()),
                _ => break,
            }
        }
        Ok(total)
    }

    /// Active subscribers and monthly revenue estimates for a creator's
    /// all-access price and each app they own
    pub async fn creator_subscription_metrics(
        &self,
        creator_id: &str,
    ) -> BillingResult<CreatorSubscriptionMetrics> {
        let fee = self.config.platform_fee_percent;
        let map = self.prices.build_price_id_map(false).await?;

        let creator_price = map
            .price_for(&PriceOwner::Creator(creator_id.to_string()))
            .map(str::to_string);
        let (unit_amount, active) = match creator_price.as_deref() {
            Some(price_id) => self.price_stats(price_id).await,
            None => (None, 0),
        };
        let all_access_gross = unit_amount.map(|unit| unit * active as i64);
        let all_access = AllAccessMetrics {
            price_id: creator_price,
            unit_amount,
            active,
            monthly_estimate_gross: all_access_gross,
            monthly_estimate_creator: all_access_gross.map(|gross| creator_share(gross, fee)),
        };

        let mut owned: Vec<_> = self
            .catalog
            .list_apps()
            .await?
            .into_iter()
            .filter(|app| app.owner_id.as_deref() == Some(creator_id))
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));

        let mut apps = Vec::with_capacity(owned.len());
        let mut apps_gross = 0_i64;
        for app in owned {
            let price_id = app.stripe_price_id.filter(|p| !p.is_empty());
            let (unit_amount, active) = match price_id.as_deref() {
                Some(price_id) => self.price_stats(price_id).await,
                None => (None, 0),
            };
            let gross = unit_amount.unwrap_or(0) * active as i64;
            apps_gross += gross;
            apps.push(AppMetrics {
                app_id: app.id,
                price_id,
                unit_amount,
                active,
                creator_monthly: creator_share(gross, fee),
            });
        }

        let gross = all_access_gross.unwrap_or(0) + apps_gross;
        tracing::debug!(
            creator_id = %creator_id,
            apps = apps.len(),
            monthly_estimate_gross = gross,
            "Creator subscription metrics computed"
        );

        Ok(CreatorSubscriptionMetrics {
            all_access,
            apps,
            totals: MetricsTotals {
                monthly_estimate_gross: gross,
                monthly_estimate_creator: creator_share(gross, fee),
            },
        })
    }

    /// Unit amount and active count; either half degrades on provider failure
    async fn price_stats(&self, price_id: &str) -> (Option<i64>, u64) {
        let unit_amount = self
            .prices
            .retrieve_price(price_id)
            .await
            .and_then(|price| price.unit_amount);
        let active = best_effort(
            "count_active_subscriptions",
            self.count_active_subscriptions_for_price(price_id),
        )
        .await
        .unwrap_or(0);
        (unit_amount, active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use storefront_shared::SubscriptionStatus;

    use crate::store::{CreatorRecord, InMemoryBillingStore};
    use crate::testing::{app, price, subscription, test_config, MockProvider};

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        provider: Arc<MockProvider>,
        metrics: MetricsService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        let config = test_config();
        let prices = Arc::new(PriceResolver::new(
            provider.clone(),
            store.clone(),
            config.price_ids.clone(),
            Duration::from_secs(60),
        ));
        let metrics = MetricsService::new(
            Arc::new(config),
            provider.clone(),
            prices,
            store.clone(),
        );
        Fixture {
            store,
            provider,
            metrics,
        }
    }

    async fn add_subscribers(
        provider: &MockProvider,
        prefix: &str,
        unit: i64,
        price_id: &str,
        count: usize,
        status: SubscriptionStatus,
    ) {
        for i in 0..count {
            provider
                .add_subscription(subscription(
                    &format!("sub_{}_{:03}", prefix, i),
                    &format!("cus_{}_{}", prefix, i),
                    status,
                    &[("si_1", price(price_id, unit, Some("month")))],
                ))
                .await;
        }
    }

    #[tokio::test]
    async fn test_count_follows_pages() {
        let f = fixture();
        add_subscribers(&f.provider, "a", 500, "price_creator", 105, SubscriptionStatus::Active)
            .await;
        add_subscribers(&f.provider, "b", 500, "price_creator", 2, SubscriptionStatus::Canceled)
            .await;
        add_subscribers(&f.provider, "c", 500, "price_other", 3, SubscriptionStatus::Active).await;

        let count = f
            .metrics
            .count_active_subscriptions_for_price("price_creator")
            .await
            .unwrap();
        assert_eq!(count, 105);

        let queries = f.provider.subscription_queries().await;
        assert_eq!(queries.len(), 2);
        assert!(queries[0].starting_after.is_none());
        assert_eq!(queries[1].starting_after.as_deref(), Some("sub_a_099"));

        assert_eq!(
            f.metrics.count_active_subscriptions_for_price("").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_creator_metrics_net_of_platform_fee() {
        let f = fixture();
        f.store
            .insert_creator(CreatorRecord {
                id: "creator_1".into(),
                all_access_price_id: Some("price_creator".into()),
                stripe_price_id: None,
                stripe_account_id: Some("acct_1".into()),
            })
            .await;
        let mut owned = app("app_1", Some("price_app_1"));
        owned.owner_id = Some("creator_1".into());
        f.store.insert_app(owned).await;
        let mut unpriced = app("app_2", None);
        unpriced.owner_id = Some("creator_1".into());
        f.store.insert_app(unpriced).await;
        let mut foreign = app("app_3", Some("price_app_3"));
        foreign.owner_id = Some("creator_2".into());
        f.store.insert_app(foreign).await;

        f.provider.add_price("price_creator", 500, Some("month")).await;
        f.provider.add_price("price_app_1", 300, Some("month")).await;
        add_subscribers(&f.provider, "a", 500, "price_creator", 3, SubscriptionStatus::Active)
            .await;
        add_subscribers(&f.provider, "b", 500, "price_creator", 1, SubscriptionStatus::Canceled)
            .await;
        add_subscribers(&f.provider, "c", 300, "price_app_1", 2, SubscriptionStatus::Active).await;

        let metrics = f
            .metrics
            .creator_subscription_metrics("creator_1")
            .await
            .unwrap();

        assert_eq!(metrics.all_access.price_id.as_deref(), Some("price_creator"));
        assert_eq!(metrics.all_access.active, 3);
        assert_eq!(metrics.all_access.monthly_estimate_gross, Some(1500));
        // 10% platform fee
        assert_eq!(metrics.all_access.monthly_estimate_creator, Some(1350));

        let app_ids: Vec<&str> = metrics.apps.iter().map(|a| a.app_id.as_str()).collect();
        assert_eq!(app_ids, vec!["app_1", "app_2"]);
        assert_eq!(metrics.apps[0].active, 2);
        assert_eq!(metrics.apps[0].creator_monthly, 540);
        assert_eq!(metrics.apps[1].active, 0);
        assert_eq!(metrics.apps[1].unit_amount, None);
        assert_eq!(metrics.apps[1].creator_monthly, 0);

        assert_eq!(metrics.totals.monthly_estimate_gross, 2100);
        assert_eq!(metrics.totals.monthly_estimate_creator, 1890);
    }

    #[tokio::test]
    async fn test_provider_failures_degrade_to_zero() {
        let f = fixture();
        f.store
            .insert_creator(CreatorRecord {
                id: "creator_1".into(),
                all_access_price_id: Some("price_creator".into()),
                stripe_price_id: None,
                stripe_account_id: None,
            })
            .await;
        f.provider.fail_on("list_subscriptions").await;

        let metrics = f
            .metrics
            .creator_subscription_metrics("creator_1")
            .await
            .unwrap();
        assert_eq!(metrics.all_access.active, 0);
        assert_eq!(metrics.all_access.unit_amount, None);
        assert_eq!(metrics.all_access.monthly_estimate_gross, None);
        assert!(metrics.apps.is_empty());
        assert_eq!(metrics.totals.monthly_estimate_gross, 0);
    }
}
