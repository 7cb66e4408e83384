//! Price resolution cache
//!
//! Maps raw Stripe identifiers (price or product ids) to canonical price ids
//! and keeps a TTL-bounded map between price ids and the apps/creators that
//! own them. The map is a pure optimization: it is rebuilt from the catalog
//! by constructing a fresh map and swapping it in, so readers never observe a
//! partially built map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use storefront_shared::EntitlementFeature;
use tokio::sync::RwLock;

use crate::client::PriceIds;
use crate::error::{best_effort, BillingError, BillingResult};
use crate::provider::{Metadata, PaymentProvider, Price};
use crate::store::{AppRecord, CatalogStore};

/// Owner of a catalog price
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PriceOwner {
    App(String),
    Creator(String),
}

impl PriceOwner {
    fn map_key(&self) -> String {
        match self {
            PriceOwner::App(id) => format!("appId:{}", id),
            PriceOwner::Creator(id) => format!("creatorId:{}", id),
        }
    }
}

impl std::fmt::Display for PriceOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.map_key())
    }
}

/// Immutable snapshot of price ownership
#[derive(Debug, Default)]
pub struct PriceIdMap {
    owners: HashMap<String, PriceOwner>,
    prices: HashMap<String, String>,
}

impl PriceIdMap {
    pub fn from_catalog(apps: &[AppRecord], creators: &[crate::store::CreatorRecord]) -> Self {
        let mut map = Self::default();
        for app in apps {
            if let Some(price_id) = app.stripe_price_id.as_deref().filter(|p| !p.is_empty()) {
                map.insert(price_id, PriceOwner::App(app.id.clone()));
            }
        }
        for creator in creators {
            if let Some(price_id) = creator.subscription_price_id().filter(|p| !p.is_empty()) {
                map.insert(price_id, PriceOwner::Creator(creator.id.clone()));
            }
        }
        map
    }

    fn insert(&mut self, price_id: &str, owner: PriceOwner) {
        self.prices.insert(owner.map_key(), price_id.to_string());
        self.owners.insert(price_id.to_string(), owner);
    }

    pub fn owner_of(&self, price_id: &str) -> Option<&PriceOwner> {
        self.owners.get(price_id)
    }

    pub fn price_for(&self, owner: &PriceOwner) -> Option<&str> {
        self.prices.get(&owner.map_key()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Ownership expressed as Stripe-style metadata (`appId` / `creatorId`)
    pub fn metadata_for(&self, price_id: &str) -> Metadata {
        let mut metadata = Metadata::new();
        match self.owner_of(price_id) {
            Some(PriceOwner::App(id)) => {
                metadata.insert("appId".to_string(), id.clone());
            }
            Some(PriceOwner::Creator(id)) => {
                metadata.insert("creatorId".to_string(), id.clone());
            }
            None => {}
        }
        metadata
    }
}

struct MapSnapshot {
    built_at: Instant,
    map: Arc<PriceIdMap>,
}

/// Platform package offered for subscription
#[derive(Debug, Clone, Serialize)]
pub struct Package {
    pub id: &'static str,
    pub name: &'static str,
    pub tier: &'static str,
    pub feature: EntitlementFeature,
    pub price_id: String,
    pub unit_amount: Option<i64>,
    pub currency: Option<String>,
    pub billing_period: String,
}

/// Resolves and caches price identifiers
pub struct PriceResolver {
    provider: Arc<dyn PaymentProvider>,
    catalog: Arc<dyn CatalogStore>,
    packages: PriceIds,
    ttl: Duration,
    resolved: RwLock<HashMap<String, String>>,
    prices: RwLock<HashMap<String, Price>>,
    map: RwLock<Option<MapSnapshot>>,
}

impl PriceResolver {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        catalog: Arc<dyn CatalogStore>,
        packages: PriceIds,
        ttl: Duration,
    ) -> Self {
        Self {
            provider,
            catalog,
            packages,
            ttl,
            resolved: RwLock::new(HashMap::new()),
            prices: RwLock::new(HashMap::new()),
            map: RwLock::new(None),
        }
    }

    /// Canonical price id for a raw price or product id
    pub async fn resolve_price_id(&self, raw_id: &str) -> BillingResult<String> {
        let trimmed = raw_id.trim();
        if trimmed.is_empty() {
            return Err(BillingError::PriceIdMissing);
        }
        if let Some(cached) = self.resolved.read().await.get(trimmed) {
            return Ok(cached.clone());
        }

        if trimmed.starts_with("prod_") {
            let product = self.provider.retrieve_product(trimmed).await?;
            let resolved = product
                .default_price
                .as_ref()
                .map(|p| p.id().to_string())
                .ok_or_else(|| BillingError::ProductMissingPrice(trimmed.to_string()))?;

            let mut cache = self.resolved.write().await;
            cache.insert(trimmed.to_string(), resolved.clone());
            cache.insert(resolved.clone(), resolved.clone());
            tracing::debug!(product_id = %trimmed, price_id = %resolved, "Resolved product default price");
            return Ok(resolved);
        }

        // `price_` ids and anything unrecognised pass through unchanged
        self.resolved
            .write()
            .await
            .insert(trimmed.to_string(), trimmed.to_string());
        Ok(trimmed.to_string())
    }

    /// Price details for display. Never fails; errors are logged and yield `None`.
    pub async fn retrieve_price(&self, raw_id: &str) -> Option<Price> {
        best_effort("retrieve_price", async {
            let price_id = self.resolve_price_id(raw_id).await?;
            if let Some(price) = self.prices.read().await.get(&price_id) {
                return Ok(price.clone());
            }
            let price = self.provider.retrieve_price(&price_id).await?;
            self.prices
                .write()
                .await
                .insert(price_id, price.clone());
            Ok(price)
        })
        .await
    }

    /// Current map, rebuilt when empty, expired or forced
    pub async fn build_price_id_map(&self, force: bool) -> BillingResult<Arc<PriceIdMap>> {
        if !force {
            if let Some(snapshot) = self.map.read().await.as_ref() {
                if !snapshot.map.is_empty() && snapshot.built_at.elapsed() < self.ttl {
                    return Ok(snapshot.map.clone());
                }
            }
        }

        let apps = self.catalog.list_apps().await?;
        let creators = self.catalog.list_creators().await?;
        let map = Arc::new(PriceIdMap::from_catalog(&apps, &creators));

        *self.map.write().await = Some(MapSnapshot {
            built_at: Instant::now(),
            map: map.clone(),
        });

        tracing::debug!(entries = map.len(), forced = force, "Price id map rebuilt");
        Ok(map)
    }

    /// App/creator ownership of a price as metadata
    pub async fn price_metadata(&self, price_id: &str) -> BillingResult<Metadata> {
        let map = self.build_price_id_map(false).await?;
        Ok(map.metadata_for(price_id))
    }

    /// Catalog price for an app or creator
    pub async fn find_price_id(&self, owner: &PriceOwner) -> BillingResult<String> {
        if let Some(snapshot) = self.map.read().await.as_ref() {
            if let Some(price_id) = snapshot.map.price_for(owner) {
                return Ok(price_id.to_string());
            }
        }
        let map = self.build_price_id_map(false).await?;
        map.price_for(owner)
            .map(str::to_string)
            .ok_or_else(|| BillingError::PriceNotFound(owner.to_string()))
    }

    /// Drop every cached entry
    pub async fn invalidate(&self) {
        self.resolved.write().await.clear();
        self.prices.write().await.clear();
        *self.map.write().await = None;
    }

    pub async fn gold_price_id(&self) -> BillingResult<Option<String>> {
        self.resolve_package(self.packages.gold.as_deref()).await
    }

    pub async fn noads_price_id(&self) -> BillingResult<Option<String>> {
        self.resolve_package(self.packages.noads.as_deref()).await
    }

    async fn resolve_package(&self, raw: Option<&str>) -> BillingResult<Option<String>> {
        match raw {
            Some(raw) => self.resolve_price_id(raw).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn package_ids(&self) -> &PriceIds {
        &self.packages
    }

    /// Find or create the monthly price for an app and store it on the app record
    pub async fn ensure_app_price(&self, app: &AppRecord) -> BillingResult<String> {
        let amount = app
            .price_cents
            .filter(|cents| *cents > 0)
            .ok_or_else(|| BillingError::PriceNotFound(PriceOwner::App(app.id.clone()).to_string()))?;

        let product = match self.provider.find_app_product(&app.id).await? {
            Some(product) => product,
            None => {
                self.provider
                    .create_product(crate::payload::clean_undefined(json!({
                        "name": app.title,
                        "metadata": {
                            "appId": app.id,
                            "creatorId": app.owner_id,
                        },
                    })))
                    .await?
            }
        };

        let existing = self
            .provider
            .list_prices(&product.id)
            .await?
            .into_iter()
            .find(|p| {
                p.active
                    && p.unit_amount == Some(amount)
                    && p.currency.as_deref() == Some("usd")
                    && p.recurring.as_ref().map(|r| r.interval.as_str()) == Some("month")
            });

        let price = match existing {
            Some(price) => price,
            None => {
                self.provider
                    .create_price(json!({
                        "product": product.id,
                        "unit_amount": amount,
                        "currency": "usd",
                        "recurring": { "interval": "month" },
                        "metadata": { "appId": app.id },
                    }))
                    .await?
            }
        };

        self.catalog.set_app_price_id(&app.id, &price.id).await?;
        self.build_price_id_map(true).await?;

        tracing::info!(
            app_id = %app.id,
            product_id = %product.id,
            price_id = %price.id,
            unit_amount = amount,
            "Provisioned app subscription price"
        );
        Ok(price.id)
    }

    /// Platform packages with best-effort price details
    pub async fn list_packages(&self) -> Vec<Package> {
        let definitions = [
            (
                "gold",
                "Gold",
                "pro",
                EntitlementFeature::Gold,
                self.packages.gold.as_deref(),
            ),
            (
                "noads",
                "No Ads",
                "addon",
                EntitlementFeature::NoAds,
                self.packages.noads.as_deref(),
            ),
        ];

        let mut packages = Vec::new();
        for (id, name, tier, feature, raw_price) in definitions {
            let Some(raw_price) = raw_price else {
                continue;
            };
            let price = self.retrieve_price(raw_price).await;
            packages.push(Package {
                id,
                name,
                tier,
                feature,
                price_id: price
                    .as_ref()
                    .map(|p| p.id.clone())
                    .unwrap_or_else(|| raw_price.to_string()),
                unit_amount: price.as_ref().and_then(|p| p.unit_amount),
                currency: price.as_ref().and_then(|p| p.currency.clone()),
                billing_period: price
                    .as_ref()
                    .and_then(|p| p.recurring.as_ref())
                    .map(|r| r.interval.clone())
                    .unwrap_or_else(|| "month".to_string()),
            });
        }
        packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreatorRecord, InMemoryBillingStore};
    use crate::testing::{app, MockProvider};

    fn resolver(
        provider: &Arc<MockProvider>,
        store: &Arc<InMemoryBillingStore>,
        ttl: Duration,
    ) -> PriceResolver {
        PriceResolver::new(
            provider.clone(),
            store.clone(),
            PriceIds {
                gold: Some("prod_gold".into()),
                noads: Some("price_noads".into()),
            },
            ttl,
        )
    }

    #[tokio::test]
    async fn test_resolve_price_id_variants() {
        let provider = Arc::new(MockProvider::new());
        provider.add_product("prod_gold", Some("price_gold")).await;
        provider.add_product("prod_empty", None).await;
        let store = Arc::new(InMemoryBillingStore::new());
        let prices = resolver(&provider, &store, Duration::from_secs(60));

        assert_eq!(prices.resolve_price_id("price_1").await.unwrap(), "price_1");
        assert_eq!(prices.resolve_price_id(" prod_gold ").await.unwrap(), "price_gold");
        assert_eq!(prices.resolve_price_id("plan_legacy").await.unwrap(), "plan_legacy");
        assert!(matches!(
            prices.resolve_price_id("  ").await,
            Err(BillingError::PriceIdMissing)
        ));
        assert!(matches!(
            prices.resolve_price_id("prod_empty").await,
            Err(BillingError::ProductMissingPrice(_))
        ));

        // memoized: the product is fetched once
        prices.resolve_price_id("prod_gold").await.unwrap();
        assert_eq!(provider.product_retrievals("prod_gold").await, 1);
    }

    #[tokio::test]
    async fn test_retrieve_price_is_best_effort() {
        let provider = Arc::new(MockProvider::new());
        provider.add_price("price_1", 500, Some("month")).await;
        let store = Arc::new(InMemoryBillingStore::new());
        let prices = resolver(&provider, &store, Duration::from_secs(60));

        assert_eq!(
            prices.retrieve_price("price_1").await.and_then(|p| p.unit_amount),
            Some(500)
        );
        assert!(prices.retrieve_price("price_missing").await.is_none());
        assert!(prices.retrieve_price("").await.is_none());
    }

    #[tokio::test]
    async fn test_map_respects_ttl_until_forced() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        store.insert_app(app("app_1", Some("price_app_1"))).await;
        let prices = resolver(&provider, &store, Duration::from_secs(3600));

        let map = prices.build_price_id_map(false).await.unwrap();
        assert_eq!(map.owner_of("price_app_1"), Some(&PriceOwner::App("app_1".into())));

        store.insert_app(app("app_2", Some("price_app_2"))).await;
        let cached = prices.build_price_id_map(false).await.unwrap();
        assert!(cached.owner_of("price_app_2").is_none());

        let rebuilt = prices.build_price_id_map(true).await.unwrap();
        assert_eq!(rebuilt.price_for(&PriceOwner::App("app_2".into())), Some("price_app_2"));

        // the earlier snapshot is untouched by the swap
        assert!(cached.owner_of("price_app_2").is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_always_rebuilds() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        store.insert_app(app("app_1", Some("price_app_1"))).await;
        let prices = resolver(&provider, &store, Duration::ZERO);

        prices.build_price_id_map(false).await.unwrap();
        store
            .insert_creator(CreatorRecord {
                id: "creator_1".into(),
                all_access_price_id: Some("price_all".into()),
                stripe_price_id: None,
                stripe_account_id: None,
            })
            .await;

        assert_eq!(
            prices
                .find_price_id(&PriceOwner::Creator("creator_1".into()))
                .await
                .unwrap(),
            "price_all"
        );
        assert_eq!(
            prices.price_metadata("price_all").await.unwrap().get("creatorId"),
            Some(&"creator_1".to_string())
        );
    }

    #[tokio::test]
    async fn test_find_price_id_not_found() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let prices = resolver(&provider, &store, Duration::from_secs(60));

        let err = prices
            .find_price_id(&PriceOwner::App("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "price_not_found");
    }

    #[tokio::test]
    async fn test_ensure_app_price_provisions_and_persists() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let mut record = app("app_1", None);
        record.price_cents = Some(499);
        store.insert_app(record.clone()).await;
        let prices = resolver(&provider, &store, Duration::from_secs(60));

        let price_id = prices.ensure_app_price(&record).await.unwrap();

        assert_eq!(
            prices
                .find_price_id(&PriceOwner::App("app_1".into()))
                .await
                .unwrap(),
            price_id
        );
        let stored = store.find_app("app_1").await.unwrap().unwrap();
        assert_eq!(stored.stripe_price_id.as_deref(), Some(price_id.as_str()));

        // a second call reuses the existing product and price
        let again = prices.ensure_app_price(&record).await.unwrap();
        assert_eq!(again, price_id);
        assert_eq!(provider.created_prices().await, 1);
    }

    #[tokio::test]
    async fn test_list_packages() {
        let provider = Arc::new(MockProvider::new());
        provider.add_product("prod_gold", Some("price_gold")).await;
        provider.add_price("price_gold", 999, Some("month")).await;
        let store = Arc::new(InMemoryBillingStore::new());
        let prices = resolver(&provider, &store, Duration::from_secs(60));

        let packages = prices.list_packages().await;
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].id, "gold");
        assert_eq!(packages[0].price_id, "price_gold");
        assert_eq!(packages[0].unit_amount, Some(999));
        // noads price is unknown to the provider; the package still lists
        assert_eq!(packages[1].tier, "addon");
        assert_eq!(packages[1].unit_amount, None);
    }
}
