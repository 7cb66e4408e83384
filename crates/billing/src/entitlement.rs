//! Entitlement records and access queries
//!
//! Entitlement ids are deterministic (feature prefix + line item or purchase
//! key), so every grant is an upsert and reconciliation can replay safely.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storefront_shared::EntitlementFeature;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::{EntitlementStore, SubscriptionStore};

/// Linkage keys stored alongside an entitlement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::timestamp::option"
    )]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_entitlement_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_key: Option<String>,
}

/// A capability granted to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,
    pub user_id: String,
    pub feature: EntitlementFeature,
    pub active: bool,
    pub data: EntitlementData,
}

impl Entitlement {
    /// Active and, when tied to a billing period, not yet expired
    pub fn is_current(&self, now: OffsetDateTime) -> bool {
        self.active && self.data.current_period_end.map_or(true, |end| end > now)
    }

    pub fn deactivated(&self) -> Self {
        Self {
            active: false,
            ..self.clone()
        }
    }
}

/// Deterministic entitlement id for a feature and its linkage key
pub fn entitlement_id(feature: EntitlementFeature, key: &str) -> String {
    match feature {
        EntitlementFeature::Gold => format!("gold-{}", key),
        EntitlementFeature::NoAds => format!("noAds-{}", key),
        EntitlementFeature::AppSubscription => format!("appSubs-{}", key),
        EntitlementFeature::CreatorAllAccess => format!("creatorSubs-{}", key),
        EntitlementFeature::Purchase => format!("purchase-{}", key),
        EntitlementFeature::ProviderFeature => key.to_string(),
    }
}

/// Read-side access checks shared by checkout and reconciliation
#[derive(Clone)]
pub struct EntitlementService {
    entitlements: Arc<dyn EntitlementStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl EntitlementService {
    pub fn new(
        entitlements: Arc<dyn EntitlementStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            entitlements,
            subscriptions,
        }
    }

    pub async fn list(&self, user_id: &str) -> BillingResult<Vec<Entitlement>> {
        self.entitlements.list_entitlements(user_id).await
    }

    /// Whether the user already owns a listing
    pub async fn has_purchase(&self, user_id: &str, listing_id: &str) -> BillingResult<bool> {
        let entitlements = self.entitlements.list_entitlements(user_id).await?;
        Ok(entitlements.iter().any(|e| {
            e.active
                && e.feature == EntitlementFeature::Purchase
                && e.data.listing_id.as_deref() == Some(listing_id)
        }))
    }

    pub async fn has_app_subscription(
        &self,
        user_id: &str,
        app_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let entitlements = self.entitlements.list_entitlements(user_id).await?;
        Ok(entitlements.iter().any(|e| {
            e.feature == EntitlementFeature::AppSubscription
                && e.data.app_id.as_deref() == Some(app_id)
                && e.is_current(now)
        }))
    }

    pub async fn has_creator_all_access(
        &self,
        user_id: &str,
        creator_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let entitlements = self.entitlements.list_entitlements(user_id).await?;
        Ok(entitlements.iter().any(|e| {
            e.feature == EntitlementFeature::CreatorAllAccess
                && e.data.creator_id.as_deref() == Some(creator_id)
                && e.is_current(now)
        }))
    }

    /// App access through either an app subscription or the owner's all-access
    pub async fn has_app_access(
        &self,
        user_id: &str,
        app_id: &str,
        owner_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        if let Some(owner_id) = owner_id {
            if self.has_creator_all_access(user_id, owner_id, now).await? {
                return Ok(true);
            }
        }
        self.has_app_subscription(user_id, app_id, now).await
    }

    /// Whether a live subscription record exists for this user and price
    pub async fn has_active_subscription_for_price(
        &self,
        user_id: &str,
        price_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let records = self.subscriptions.list_subscriptions_for_user(user_id).await?;
        Ok(records
            .iter()
            .any(|r| r.price_id.as_deref() == Some(price_id) && r.grants_access(now)))
    }

    pub async fn has_feature(
        &self,
        user_id: &str,
        feature: EntitlementFeature,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let entitlements = self.entitlements.list_entitlements(user_id).await?;
        Ok(entitlements
            .iter()
            .any(|e| e.feature == feature && e.is_current(now)))
    }
}
