use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// Billing tier attached to a user account.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub password_hash: String,
    #[serde(default)]
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: &str, name: Option<String>, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            name,
            password_hash,
            plan: Plan::Free,
            created_at: Utc::now(),
        }
    }

    /// The user as returned over the API (no credential hash).
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            email: self.email.clone(),
            name: self.name.clone(),
            plan: self.plan,
            created_at: self.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Lifecycle state of a deployment.
///
/// States only move forward: `building -> deploying -> {live | error}`, and a
/// deployment that fails before packaging starts may go straight from
/// `building` to `error`. `live` and `error` are terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Building,
    Deploying,
    Live,
    Error,
}

impl DeploymentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Live => "live",
            Self::Error => "error",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Live | Self::Error)
    }

    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Building, Self::Deploying)
                | (Self::Building, Self::Error)
                | (Self::Deploying, Self::Live)
                | (Self::Deploying, Self::Error)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illustrative usage counters; nothing here is measured telemetry.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub visits: u64,
    pub bandwidth_bytes: u64,
    pub uptime_percent: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub domain: String,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    pub output_dir: String,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_deploy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: UsageMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the caller decides about a new deployment.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub owner_id: Uuid,
    pub domain: String,
    pub project_name: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub build_command: Option<String>,
    pub output_dir: String,
}

impl Deployment {
    pub fn create(new: NewDeployment) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            domain: new.domain,
            project_name: new.project_name,
            repo_url: new.repo_url,
            branch: new.branch,
            build_command: new.build_command,
            output_dir: new.output_dir,
            status: DeploymentStatus::Building,
            url: None,
            ssl: false,
            provider_site_id: None,
            provider_deploy_id: None,
            error: None,
            metrics: UsageMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn public_url(&self) -> String {
        format!("https://{}", self.domain)
    }
}

/// Extra fields recorded together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    pub url: Option<String>,
    pub provider_site_id: Option<String>,
    pub provider_deploy_id: Option<String>,
    pub error: Option<String>,
}

impl TransitionDetails {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// JWT claims carried by every authenticated request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthPayload {
    pub sub: Uuid, // user id
    pub email: String,
    pub exp: usize,
}
