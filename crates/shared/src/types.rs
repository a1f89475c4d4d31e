//! Common types used across Siteline

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Account ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AccountId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription status of an account's entitlement record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Trial,
    Active,
    PastDue,
    Cancelled,
    Expired,
    Refunded,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Trial => write!(f, "trial"),
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
            Self::Refunded => write!(f, "refunded"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            "refunded" => Ok(Self::Refunded),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// Subscription plan of an account's entitlement record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
    None,
    Trial,
    Monthly,
    Annual,
    Lifetime,
}

impl Default for SubscriptionPlan {
    fn default() -> Self {
        Self::None
    }
}

impl SubscriptionPlan {
    /// Plans that are bought through the payment provider
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Monthly | Self::Annual | Self::Lifetime)
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Trial => write!(f, "trial"),
            Self::Monthly => write!(f, "monthly"),
            Self::Annual => write!(f, "annual"),
            Self::Lifetime => write!(f, "lifetime"),
        }
    }
}

impl std::str::FromStr for SubscriptionPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "trial" => Ok(Self::Trial),
            "monthly" => Ok(Self::Monthly),
            "annual" => Ok(Self::Annual),
            "lifetime" => Ok(Self::Lifetime),
            _ => Err(format!("Invalid subscription plan: {}", s)),
        }
    }
}

/// Role carried by an authenticated user
///
/// `Operator` and `Staff` are platform roles; the rest are roles inside a
/// customer account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Operator,
    Staff,
    Owner,
    Admin,
    Member,
    Viewer,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::Member
    }
}

impl UserRole {
    /// Platform staff see every dashboard regardless of billing state
    pub fn bypasses_paywall(&self) -> bool {
        matches!(self, Self::Operator | Self::Staff)
    }

    /// Only operators may create entitlement outside the payment provider
    pub fn can_grant_entitlements(&self) -> bool {
        matches!(self, Self::Operator)
    }

    /// Parse a role from string (case insensitive)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "operator" | "superadmin" => Self::Operator,
            "staff" => Self::Staff,
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            "member" => Self::Member,
            "viewer" => Self::Viewer,
            _ => Self::Member, // Default to member for unknown roles
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operator => write!(f, "operator"),
            Self::Staff => write!(f, "staff"),
            Self::Owner => write!(f, "owner"),
            Self::Admin => write!(f, "admin"),
            Self::Member => write!(f, "member"),
            Self::Viewer => write!(f, "viewer"),
        }
    }
}
