//! Domain enums shared across crates

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Capability granted by an entitlement record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntitlementFeature {
    /// Platform tier A; carries resource limits that must be enforced on loss
    #[serde(rename = "isGold")]
    Gold,
    /// Platform tier B
    #[serde(rename = "noAds")]
    NoAds,
    #[serde(rename = "app-subscription")]
    AppSubscription,
    #[serde(rename = "creator-all-access")]
    CreatorAllAccess,
    #[serde(rename = "purchase")]
    Purchase,
    /// Feature pushed by the provider's own entitlement summaries
    #[serde(rename = "provider-feature")]
    ProviderFeature,
}

impl EntitlementFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gold => "isGold",
            Self::NoAds => "noAds",
            Self::AppSubscription => "app-subscription",
            Self::CreatorAllAccess => "creator-all-access",
            Self::Purchase => "purchase",
            Self::ProviderFeature => "provider-feature",
        }
    }

    /// Losing this feature requires a limit-enforcement pass for the user.
    pub fn enforces_limits(&self) -> bool {
        matches!(self, Self::Gold)
    }
}

impl fmt::Display for EntitlementFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementFeature {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isGold" => Ok(Self::Gold),
            "noAds" => Ok(Self::NoAds),
            "app-subscription" => Ok(Self::AppSubscription),
            "creator-all-access" => Ok(Self::CreatorAllAccess),
            "purchase" => Ok(Self::Purchase),
            "provider-feature" => Ok(Self::ProviderFeature),
            other => Err(ParseEnumError {
                kind: "entitlement feature",
                value: other.to_string(),
            }),
        }
    }
}

/// Provider subscription states mirrored locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    /// States in which the subscriber keeps access (period end still applies)
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "paused" => Ok(Self::Paused),
            "unknown" => Ok(Self::Unknown),
            other => Err(ParseEnumError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// Checkout transaction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Payment,
    Subscription,
    Setup,
}

impl CheckoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Subscription => "subscription",
            Self::Setup => "setup",
        }
    }
}

impl fmt::Display for CheckoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
