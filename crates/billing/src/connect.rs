//! Creator payout accounts (Stripe Connect Express)

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::client::StripeConfig;
use crate::error::{best_effort, BillingError, BillingResult};
use crate::provider::{Account, PaymentProvider};
use crate::store::CatalogStore;

/// Days Stripe holds creator funds before paying out
const PAYOUT_DELAY_DAYS: u32 = 3;

/// Onboarding progress of a connected account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingState {
    NotStarted,
    Pending,
    Complete,
}

/// Payout readiness of a creator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectStatus {
    pub state: OnboardingState,
    /// A connected account exists and could be read
    pub onboarded: bool,
    pub account_id: Option<String>,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub requirements_due: Vec<String>,
}

impl ConnectStatus {
    pub fn not_started() -> Self {
        Self {
            state: OnboardingState::NotStarted,
            onboarded: false,
            account_id: None,
            charges_enabled: false,
            payouts_enabled: false,
            details_submitted: false,
            requirements_due: Vec::new(),
        }
    }

    pub fn from_account(account: &Account) -> Self {
        let complete =
            account.charges_enabled && account.payouts_enabled && account.details_submitted;
        Self {
            state: if complete {
                OnboardingState::Complete
            } else {
                OnboardingState::Pending
            },
            onboarded: true,
            account_id: Some(account.id.clone()),
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
            details_submitted: account.details_submitted,
            requirements_due: account
                .requirements
                .as_ref()
                .map(|r| r.currently_due.clone())
                .unwrap_or_default(),
        }
    }

    /// An account id is stored but the provider could not return it
    fn unreadable(account_id: &str) -> Self {
        Self {
            state: OnboardingState::Pending,
            account_id: Some(account_id.to_string()),
            ..Self::not_started()
        }
    }
}

/// Hosted onboarding link for a creator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingLink {
    pub account_id: String,
    pub url: String,
}

/// Login link into the creator's Express dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardLink {
    pub url: String,
}

#[derive(Clone)]
pub struct ConnectService {
    config: Arc<StripeConfig>,
    provider: Arc<dyn PaymentProvider>,
    catalog: Arc<dyn CatalogStore>,
}

impl ConnectService {
    pub fn new(
        config: Arc<StripeConfig>,
        provider: Arc<dyn PaymentProvider>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            config,
            provider,
            catalog,
        }
    }

    /// Create the creator's Express account on first use and return an
    /// onboarding link for it
    pub async fn create_or_reuse_account(
        &self,
        creator_id: &str,
        return_url: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<OnboardingLink> {
        let account_id = match self.catalog.get_payout_account(creator_id).await? {
            Some(account_id) => account_id,
            None => {
                let account = self
                    .provider
                    .create_account(
                        json!({
                            "type": "express",
                            "capabilities": {
                                "card_payments": {"requested": true},
                                "transfers": {"requested": true},
                            },
                            "metadata": {"creatorId": creator_id},
                        }),
                        idempotency_key,
                    )
                    .await?;
                self.catalog
                    .set_payout_account(creator_id, &account.id)
                    .await?;
                tracing::info!(
                    creator_id = %creator_id,
                    account_id = %account.id,
                    "Connected account created"
                );
                account.id
            }
        };

        // Not every country or risk profile allows a custom schedule
        best_effort(
            "set_payout_schedule",
            self.provider.update_account(
                &account_id,
                json!({
                    "settings": {
                        "payouts": {
                            "schedule": {
                                "interval": "daily",
                                "delay_days": PAYOUT_DELAY_DAYS,
                            }
                        }
                    }
                }),
            ),
        )
        .await;

        let link = self
            .provider
            .create_account_link(&account_id, &self.config.cancel_url, return_url)
            .await?;

        Ok(OnboardingLink {
            account_id,
            url: link.url,
        })
    }

    /// Express dashboard login link for an onboarded creator
    pub async fn create_dashboard_link(&self, creator_id: &str) -> BillingResult<DashboardLink> {
        let account_id = self
            .catalog
            .get_payout_account(creator_id)
            .await?
            .ok_or_else(|| BillingError::CreatorNotOnboarded(creator_id.to_string()))?;

        let link = self.provider.create_login_link(&account_id).await?;
        Ok(DashboardLink { url: link.url })
    }

    pub async fn get_connect_status(&self, creator_id: &str) -> BillingResult<ConnectStatus> {
        let Some(account_id) = self.catalog.get_payout_account(creator_id).await? else {
            return Ok(ConnectStatus::not_started());
        };

        match self.provider.retrieve_account(&account_id).await {
            Ok(account) => Ok(ConnectStatus::from_account(&account)),
            Err(e) => {
                tracing::warn!(
                    creator_id = %creator_id,
                    account_id = %account_id,
                    error = %e,
                    "Failed to retrieve connected account"
                );
                Ok(ConnectStatus::unreadable(&account_id))
            }
        }
    }

    /// Map an updated account back to its creator
    pub async fn refresh_connect_status(
        &self,
        account: &Account,
    ) -> BillingResult<Option<(String, ConnectStatus)>> {
        let creators = self.catalog.list_creators().await?;
        let Some(creator) = creators
            .into_iter()
            .find(|c| c.stripe_account_id.as_deref() == Some(account.id.as_str()))
        else {
            tracing::debug!(account_id = %account.id, "Account update for unknown creator");
            return Ok(None);
        };

        let status = ConnectStatus::from_account(account);
        tracing::info!(
            creator_id = %creator.id,
            account_id = %account.id,
            state = ?status.state,
            "Connect status refreshed"
        );
        Ok(Some((creator.id, status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AccountRequirements;
    use crate::store::{CreatorRecord, InMemoryBillingStore};
    use crate::testing::{test_config, MockProvider};

    fn account(id: &str, ready: bool) -> Account {
        Account {
            id: id.into(),
            charges_enabled: ready,
            payouts_enabled: ready,
            details_submitted: ready,
            requirements: Some(AccountRequirements {
                currently_due: if ready {
                    vec![]
                } else {
                    vec!["external_account".into()]
                },
                disabled_reason: None,
            }),
        }
    }

    fn service(
        store: &Arc<InMemoryBillingStore>,
        provider: &Arc<MockProvider>,
    ) -> ConnectService {
        ConnectService::new(Arc::new(test_config()), provider.clone(), store.clone())
    }

    #[tokio::test]
    async fn test_creates_account_once() {
        let store = Arc::new(InMemoryBillingStore::new());
        store
            .insert_creator(CreatorRecord {
                id: "creator_1".into(),
                all_access_price_id: None,
                stripe_price_id: None,
                stripe_account_id: None,
            })
            .await;
        let provider = Arc::new(MockProvider::new());
        let connect = service(&store, &provider);

        let first = connect
            .create_or_reuse_account("creator_1", "https://app.test/return", Some("onboard-1"))
            .await
            .unwrap();
        let second = connect
            .create_or_reuse_account("creator_1", "https://app.test/return", None)
            .await
            .unwrap();

        assert_eq!(first.account_id, second.account_id);
        let created = provider.created_accounts().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].params["type"], "express");
        assert_eq!(created[0].idempotency_key.as_deref(), Some("onboard-1"));

        let updates = provider.account_updates().await;
        assert_eq!(
            updates[0].params["settings"]["payouts"]["schedule"]["delay_days"],
            3
        );
        let links = provider.account_links().await;
        assert_eq!(links[0].1, test_config().cancel_url);
        assert_eq!(links[0].2, "https://app.test/return");
    }

    #[tokio::test]
    async fn test_payout_schedule_failure_still_links() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        provider.fail_on("update_account").await;
        let connect = service(&store, &provider);

        let link = connect
            .create_or_reuse_account("creator_1", "https://app.test/return", None)
            .await
            .unwrap();
        assert!(!link.url.is_empty());
    }

    #[tokio::test]
    async fn test_status_states() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        let connect = service(&store, &provider);

        let status = connect.get_connect_status("creator_1").await.unwrap();
        assert_eq!(status.state, OnboardingState::NotStarted);

        provider.add_account(account("acct_1", false)).await;
        store.set_payout_account("creator_1", "acct_1").await.unwrap();
        let status = connect.get_connect_status("creator_1").await.unwrap();
        assert_eq!(status.state, OnboardingState::Pending);
        assert!(status.onboarded);
        assert_eq!(status.requirements_due, vec!["external_account".to_string()]);

        provider.add_account(account("acct_1", true)).await;
        let status = connect.get_connect_status("creator_1").await.unwrap();
        assert_eq!(status.state, OnboardingState::Complete);
    }

    #[tokio::test]
    async fn test_dashboard_link_requires_payout_account() {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(MockProvider::new());
        let connect = service(&store, &provider);

        let err = connect.create_dashboard_link("creator_1").await.unwrap_err();
        assert!(matches!(err, BillingError::CreatorNotOnboarded(_)));
        assert!(provider.login_links().await.is_empty());

        store.set_payout_account("creator_1", "acct_1").await.unwrap();
        let link = connect.create_dashboard_link("creator_1").await.unwrap();
        assert!(link.url.ends_with("/acct_1"));
        assert_eq!(provider.login_links().await, vec!["acct_1".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_account_is_not_onboarded() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.set_payout_account("creator_1", "acct_gone").await.unwrap();
        let provider = Arc::new(MockProvider::new());
        let connect = service(&store, &provider);

        let status = connect.get_connect_status("creator_1").await.unwrap();
        assert!(!status.onboarded);
        assert_eq!(status.account_id.as_deref(), Some("acct_gone"));
    }

    #[tokio::test]
    async fn test_refresh_maps_account_to_creator() {
        let store = Arc::new(InMemoryBillingStore::new());
        store
            .insert_creator(CreatorRecord {
                id: "creator_1".into(),
                all_access_price_id: None,
                stripe_price_id: None,
                stripe_account_id: Some("acct_1".into()),
            })
            .await;
        let provider = Arc::new(MockProvider::new());
        let connect = service(&store, &provider);

        let (creator_id, status) = connect
            .refresh_connect_status(&account("acct_1", true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(creator_id, "creator_1");
        assert_eq!(status.state, OnboardingState::Complete);
        assert!(connect
            .refresh_connect_status(&account("acct_other", true))
            .await
            .unwrap()
            .is_none());
    }
}
