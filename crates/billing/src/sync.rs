//! Subscription to entitlement synchronization
//!
//! Given a provider subscription snapshot, derive one entitlement per line
//! item and deactivate the entitlements of items that are no longer on the
//! subscription. Every write is an upsert by deterministic id, so replaying
//! the same snapshot converges to the same state.

use std::collections::HashSet;
use std::sync::Arc;

use storefront_shared::EntitlementFeature;
use time::OffsetDateTime;

use crate::entitlement::{entitlement_id, Entitlement, EntitlementData};
use crate::error::{best_effort, BillingResult};
use crate::prices::PriceResolver;
use crate::provider::{Metadata, PaymentProvider, Subscription, SubscriptionItem};
use crate::store::{
    CustomerStore, EntitlementStore, LimitEnforcer, SubscriptionRecord, SubscriptionStore,
};

/// What a sync run touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub user_id: String,
    pub upserted: Vec<String>,
    pub deactivated: Vec<String>,
}

pub struct EntitlementSynchronizer {
    provider: Arc<dyn PaymentProvider>,
    prices: Arc<PriceResolver>,
    entitlements: Arc<dyn EntitlementStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    customers: Arc<dyn CustomerStore>,
    limits: Arc<dyn LimitEnforcer>,
}

impl EntitlementSynchronizer {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        prices: Arc<PriceResolver>,
        entitlements: Arc<dyn EntitlementStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        customers: Arc<dyn CustomerStore>,
        limits: Arc<dyn LimitEnforcer>,
    ) -> Self {
        Self {
            provider,
            prices,
            entitlements,
            subscriptions,
            customers,
            limits,
        }
    }

    /// Apply a subscription snapshot to the user's entitlements.
    ///
    /// Never fails: an unresolvable user or a store error is logged and the
    /// run is abandoned, returning `None`.
    pub async fn sync(
        &self,
        sub: &Subscription,
        active: bool,
        user_id: Option<&str>,
    ) -> Option<SyncSummary> {
        let user_id = match self.resolve_user(sub, user_id).await {
            Some(user_id) => user_id,
            None => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    customer_id = ?sub.customer_id(),
                    "Missing user id for subscription, skipping entitlement sync"
                );
                return None;
            }
        };

        match self.apply(sub, active, &user_id).await {
            Ok(summary) => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %sub.id,
                    active = active,
                    upserted = summary.upserted.len(),
                    deactivated = summary.deactivated.len(),
                    "Entitlements synchronized"
                );
                Some(summary)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    subscription_id = %sub.id,
                    error = %e,
                    "Entitlement sync failed"
                );
                None
            }
        }
    }

    /// Record the subscription snapshot, then sync entitlements from it.
    ///
    /// Snapshots older than the stored record are rejected and skip the sync;
    /// returns whether the snapshot was applied.
    pub async fn project(
        &self,
        sub: &Subscription,
        user_id: &str,
        active: bool,
        observed_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let record = SubscriptionRecord::from_subscription(sub, user_id, observed_at);
        if !self.subscriptions.upsert_subscription(&record).await? {
            tracing::warn!(
                subscription_id = %sub.id,
                user_id = %user_id,
                observed_at = %observed_at,
                "Ignoring stale subscription snapshot"
            );
            return Ok(false);
        }
        self.sync(sub, active, Some(user_id)).await;
        Ok(true)
    }

    async fn resolve_user(&self, sub: &Subscription, user_id: Option<&str>) -> Option<String> {
        if let Some(user_id) = user_id.filter(|u| !u.is_empty()) {
            return Some(user_id.to_string());
        }
        if let Some(user_id) = sub.metadata.get("userId").filter(|u| !u.is_empty()) {
            return Some(user_id.clone());
        }
        let customer_id = sub.customer_id()?;
        best_effort(
            "lookup_user_by_customer",
            self.customers.get_user_id_by_customer(customer_id),
        )
        .await
        .flatten()
    }

    async fn apply(
        &self,
        sub: &Subscription,
        active: bool,
        user_id: &str,
    ) -> BillingResult<SyncSummary> {
        let existing = self.entitlements.list_entitlements(user_id).await?;
        let gold = best_effort("resolve_gold_price", self.prices.gold_price_id())
            .await
            .flatten();
        let noads = best_effort("resolve_noads_price", self.prices.noads_price_id())
            .await
            .flatten();

        let mut summary = SyncSummary {
            user_id: user_id.to_string(),
            ..Default::default()
        };
        let item_ids: HashSet<&str> = sub.items.data.iter().map(|i| i.id.as_str()).collect();

        for item in &sub.items.data {
            let price_id = item.price.id.as_str();
            let metadata = self.item_metadata(item).await;
            let data = EntitlementData {
                stripe_customer_id: sub.customer_id().map(str::to_string),
                stripe_subscription_id: Some(sub.id.clone()),
                item_id: Some(item.id.clone()),
                price_id: Some(price_id.to_string()),
                current_period_end: sub.period_end(),
                ..Default::default()
            };

            let (feature, data) = if gold.as_deref() == Some(price_id) {
                (EntitlementFeature::Gold, data)
            } else if noads.as_deref() == Some(price_id) {
                (EntitlementFeature::NoAds, data)
            } else if let Some(app_id) = metadata.get("appId") {
                (
                    EntitlementFeature::AppSubscription,
                    EntitlementData {
                        app_id: Some(app_id.clone()),
                        ..data
                    },
                )
            } else if let Some(creator_id) = metadata.get("creatorId") {
                (
                    EntitlementFeature::CreatorAllAccess,
                    EntitlementData {
                        creator_id: Some(creator_id.clone()),
                        ..data
                    },
                )
            } else {
                tracing::debug!(
                    subscription_id = %sub.id,
                    item_id = %item.id,
                    price_id = %price_id,
                    "Line item does not map to an entitlement"
                );
                continue;
            };

            let entitlement = Entitlement {
                id: entitlement_id(feature, &item.id),
                user_id: user_id.to_string(),
                feature,
                active,
                data,
            };
            self.entitlements.upsert_entitlement(&entitlement).await?;
            summary.upserted.push(entitlement.id);

            if feature.enforces_limits() && !active {
                self.limits.enforce_limit(user_id).await?;
            }
        }

        for entitlement in existing {
            if entitlement.data.stripe_subscription_id.as_deref() != Some(sub.id.as_str()) {
                continue;
            }
            let Some(item_id) = entitlement.data.item_id.as_deref() else {
                continue;
            };
            if item_ids.contains(item_id) || !entitlement.active {
                continue;
            }

            self.entitlements
                .upsert_entitlement(&entitlement.deactivated())
                .await?;
            tracing::info!(
                user_id = %user_id,
                entitlement_id = %entitlement.id,
                subscription_id = %sub.id,
                "Deactivated entitlement for removed line item"
            );
            if entitlement.feature.enforces_limits() {
                self.limits.enforce_limit(user_id).await?;
            }
            summary.deactivated.push(entitlement.id);
        }

        Ok(summary)
    }

    /// Product metadata, overlaid by price metadata, overlaid by catalog ownership
    async fn item_metadata(&self, item: &SubscriptionItem) -> Metadata {
        let mut metadata = Metadata::new();

        if let Some(product) = item.price.product.as_ref() {
            match product.as_object() {
                Some(product) => metadata.extend(product.metadata.clone()),
                None => {
                    if let Some(product) =
                        best_effort("retrieve_product", self.provider.retrieve_product(product.id()))
                            .await
                    {
                        metadata.extend(product.metadata);
                    }
                }
            }
        }
        metadata.extend(item.price.metadata.clone());

        if let Some(owned) =
            best_effort("price_metadata", self.prices.price_metadata(&item.price.id)).await
        {
            metadata.extend(owned);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use storefront_shared::SubscriptionStatus;
    use time::macros::datetime;

    use crate::client::PriceIds;
    use crate::store::{CreatorRecord, InMemoryBillingStore};
    use crate::testing::{app, price, subscription, MockProvider};

    async fn fixture() -> (Arc<InMemoryBillingStore>, EntitlementSynchronizer) {
        let store = Arc::new(InMemoryBillingStore::new());
        store.insert_app(app("app_1", Some("price_app_1"))).await;
        store
            .insert_creator(CreatorRecord {
                id: "creator_1".into(),
                all_access_price_id: Some("price_all_1".into()),
                stripe_price_id: None,
                stripe_account_id: Some("acct_1".into()),
            })
            .await;
        store.set_customer_for_user("u1", "cus_1").await.unwrap();

        let provider = Arc::new(MockProvider::new());
        let prices = Arc::new(PriceResolver::new(
            provider.clone(),
            store.clone(),
            PriceIds {
                gold: Some("price_gold".into()),
                noads: Some("price_noads".into()),
            },
            Duration::from_secs(60),
        ));
        let sync = EntitlementSynchronizer::new(
            provider,
            prices,
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        (store, sync)
    }

    #[tokio::test]
    async fn test_classifies_each_item() {
        let (store, sync) = fixture().await;
        let sub = subscription(
            "sub_1",
            "cus_1",
            SubscriptionStatus::Active,
            &[
                ("si_gold", price("price_gold", 999, Some("month"))),
                ("si_noads", price("price_noads", 199, Some("month"))),
                ("si_app", price("price_app_1", 500, Some("month"))),
                ("si_all", price("price_all_1", 1500, Some("month"))),
            ],
        );

        let summary = sync.sync(&sub, true, None).await.unwrap();
        assert_eq!(summary.user_id, "u1");
        assert_eq!(
            summary.upserted,
            vec!["gold-si_gold", "noAds-si_noads", "appSubs-si_app", "creatorSubs-si_all"]
        );

        let ents = store.list_entitlements("u1").await.unwrap();
        let app_ent = ents.iter().find(|e| e.id == "appSubs-si_app").unwrap();
        assert_eq!(app_ent.data.app_id.as_deref(), Some("app_1"));
        assert_eq!(app_ent.data.stripe_subscription_id.as_deref(), Some("sub_1"));
        let all = ents.iter().find(|e| e.id == "creatorSubs-si_all").unwrap();
        assert_eq!(all.data.creator_id.as_deref(), Some("creator_1"));
        assert!(ents.iter().all(|e| e.active));
    }

    #[tokio::test]
    async fn test_price_metadata_classifies_unknown_catalog_price() {
        let (store, sync) = fixture().await;
        let mut item_price = price("price_other", 300, Some("month"));
        item_price.metadata.insert("appId".into(), "app_9".into());
        let sub = subscription("sub_1", "cus_1", SubscriptionStatus::Active, &[("si_1", item_price)]);

        sync.sync(&sub, true, Some("u1")).await.unwrap();
        let ents = store.list_entitlements("u1").await.unwrap();
        assert_eq!(ents[0].data.app_id.as_deref(), Some("app_9"));
    }

    #[tokio::test]
    async fn test_unresolvable_user_is_noop() {
        let (store, sync) = fixture().await;
        let sub = subscription(
            "sub_1",
            "cus_unknown",
            SubscriptionStatus::Active,
            &[("si_gold", price("price_gold", 999, Some("month")))],
        );
        let before = store.write_count().await;

        assert!(sync.sync(&sub, true, None).await.is_none());
        assert_eq!(store.write_count().await, before);
    }

    #[tokio::test]
    async fn test_deactivating_gold_enforces_limits() {
        let (store, sync) = fixture().await;
        let sub = subscription(
            "sub_1",
            "cus_1",
            SubscriptionStatus::Canceled,
            &[("si_gold", price("price_gold", 999, Some("month")))],
        );

        sync.sync(&sub, false, None).await.unwrap();
        assert_eq!(store.limit_requests().await, vec!["u1".to_string()]);
        assert!(!store.list_entitlements("u1").await.unwrap()[0].active);
    }

    #[tokio::test]
    async fn test_removed_gold_item_enforces_limits() {
        let (store, sync) = fixture().await;
        let both = subscription(
            "sub_1",
            "cus_1",
            SubscriptionStatus::Active,
            &[
                ("si_gold", price("price_gold", 999, Some("month"))),
                ("si_noads", price("price_noads", 199, Some("month"))),
            ],
        );
        sync.sync(&both, true, None).await.unwrap();

        let only_noads = subscription(
            "sub_1",
            "cus_1",
            SubscriptionStatus::Active,
            &[("si_noads", price("price_noads", 199, Some("month")))],
        );
        let summary = sync.sync(&only_noads, true, None).await.unwrap();
        assert_eq!(summary.deactivated, vec!["gold-si_gold"]);
        assert_eq!(store.limit_requests().await.len(), 1);

        // entitlements of other subscriptions are untouched
        let other = subscription(
            "sub_2",
            "cus_1",
            SubscriptionStatus::Active,
            &[("si_app", price("price_app_1", 500, Some("month")))],
        );
        sync.sync(&other, true, None).await.unwrap();
        let ents = store.list_entitlements("u1").await.unwrap();
        assert!(ents.iter().find(|e| e.id == "noAds-si_noads").unwrap().active);
    }

    #[tokio::test]
    async fn test_project_rejects_older_snapshot() {
        let (store, sync) = fixture().await;
        let active = subscription(
            "sub_1",
            "cus_1",
            SubscriptionStatus::Active,
            &[("si_gold", price("price_gold", 999, Some("month")))],
        );
        let canceled = subscription(
            "sub_1",
            "cus_1",
            SubscriptionStatus::Canceled,
            &[("si_gold", price("price_gold", 999, Some("month")))],
        );

        assert!(sync
            .project(&canceled, "u1", false, datetime!(2025-03-02 0:00 UTC))
            .await
            .unwrap());
        assert!(!sync
            .project(&active, "u1", true, datetime!(2025-03-01 0:00 UTC))
            .await
            .unwrap());

        let record = store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert!(!store.list_entitlements("u1").await.unwrap()[0].active);
    }
}
