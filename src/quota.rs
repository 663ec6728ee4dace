//! Quota and entitlement gate.
//!
//! Every upload is attributed to a *scope*: the authenticated user id when
//! there is one, otherwise a salted SHA-256 of the client IP. Raw IPs are
//! never written anywhere. Privileged subscribers bypass the counter
//! entirely; everyone else reserves one unit per upload against a per-scope
//! UTC-day counter.

use crate::error::PipelineError;
use crate::store::UsageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Who is asking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
}

impl CallerIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            client_ip: None,
        }
    }

    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            user_id: None,
            client_ip: Some(ip.into()),
        }
    }

    /// The user id, unless it is missing or empty.
    pub fn authenticated_user(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Quota scope: `user:<id>` or `ip:<hex sha256(salt ":" ip)>`.
    pub fn scope(&self, salt: &str) -> String {
        if let Some(id) = self.authenticated_user() {
            return format!("user:{id}");
        }
        let ip = self
            .client_ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .unwrap_or("unknown");
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(b":");
        hasher.update(ip.as_bytes());
        format!("ip:{}", hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    Unpaid,
}

/// A user's subscription as reported by the billing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub plan: Plan,
    pub status: SubscriptionStatus,
}

impl Entitlement {
    /// Pro users keep unlimited access through the dunning period.
    pub fn is_privileged(&self) -> bool {
        self.plan == Plan::Pro
            && matches!(
                self.status,
                SubscriptionStatus::Active
                    | SubscriptionStatus::Trialing
                    | SubscriptionStatus::PastDue
            )
    }
}

/// Looks up a user's entitlement.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<Option<Entitlement>, PipelineError>;
}

/// Fixed user → entitlement table. Unknown users are on the free plan.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    entries: HashMap<String, Entitlement>,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user_id: impl Into<String>, entitlement: Entitlement) -> Self {
        self.entries.insert(user_id.into(), entitlement);
        self
    }
}

#[async_trait]
impl EntitlementSource for StaticEntitlements {
    async fn lookup(&self, user_id: &str) -> Result<Option<Entitlement>, PipelineError> {
        Ok(self.entries.get(user_id).copied())
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDecision {
    pub allowed: bool,
    pub privileged: bool,
    /// `None` for privileged callers.
    pub limit: Option<u32>,
    pub count: u32,
    pub remaining: Option<u32>,
}

impl UsageDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            privileged: true,
            limit: None,
            count: 0,
            remaining: None,
        }
    }

    fn metered(allowed: bool, limit: u32, count: u32) -> Self {
        Self {
            allowed,
            privileged: false,
            limit: Some(limit),
            count,
            remaining: Some(limit.saturating_sub(count)),
        }
    }
}

/// UTC calendar day used as the counter key.
pub fn date_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

pub struct QuotaGate {
    usage: Arc<dyn UsageStore>,
    entitlements: Arc<dyn EntitlementSource>,
    daily_limit: u32,
    salt: String,
}

impl QuotaGate {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        entitlements: Arc<dyn EntitlementSource>,
        daily_limit: u32,
        salt: impl Into<String>,
    ) -> Self {
        Self {
            usage,
            entitlements,
            daily_limit,
            salt: salt.into(),
        }
    }

    pub fn scope_of(&self, identity: &CallerIdentity) -> String {
        identity.scope(&self.salt)
    }

    async fn privileged(&self, identity: &CallerIdentity) -> Result<bool, PipelineError> {
        let Some(user_id) = identity.authenticated_user() else {
            return Ok(false);
        };
        Ok(self
            .entitlements
            .lookup(user_id)
            .await?
            .is_some_and(|e| e.is_privileged()))
    }

    /// Reserve one upload for today. Denial is `PipelineError::UsageLimit`.
    pub async fn reserve(&self, identity: &CallerIdentity) -> Result<UsageDecision, PipelineError> {
        self.reserve_at(identity, Utc::now()).await
    }

    pub async fn reserve_at(
        &self,
        identity: &CallerIdentity,
        now: DateTime<Utc>,
    ) -> Result<UsageDecision, PipelineError> {
        if self.privileged(identity).await? {
            debug!("Privileged caller, quota bypassed");
            return Ok(UsageDecision::unlimited());
        }

        let scope = self.scope_of(identity);
        let reservation = self
            .usage
            .reserve(&scope, &date_key(now), self.daily_limit)
            .await?;
        let decision = UsageDecision::metered(reservation.allowed, self.daily_limit, reservation.count);

        if !decision.allowed {
            info!("Daily limit reached for {}", scope);
            return Err(PipelineError::UsageLimit {
                limit: self.daily_limit,
                count: reservation.count,
                remaining: 0,
            });
        }
        Ok(decision)
    }

    /// Current standing without reserving anything.
    pub async fn usage(&self, identity: &CallerIdentity) -> Result<UsageDecision, PipelineError> {
        self.usage_at(identity, Utc::now()).await
    }

    pub async fn usage_at(
        &self,
        identity: &CallerIdentity,
        now: DateTime<Utc>,
    ) -> Result<UsageDecision, PipelineError> {
        if self.privileged(identity).await? {
            return Ok(UsageDecision::unlimited());
        }
        let count = self
            .usage
            .current(&self.scope_of(identity), &date_key(now))
            .await?;
        Ok(UsageDecision::metered(
            count < self.daily_limit,
            self.daily_limit,
            count,
        ))
    }
}
