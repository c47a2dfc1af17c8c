//! Sled-backed store for users and deployments.
//!
//! Trees:
//! - `users`: lower-cased email -> JSON `User`
//! - `deployments`: deployment id -> JSON `Deployment`
//! - `domains`: domain -> deployment id (uniqueness index)
//!
//! The domain index and the record are written in one multi-tree transaction,
//! so two concurrent creations for the same domain cannot both succeed.

use std::path::Path;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Db;
use uuid::Uuid;

use crate::models::{Deployment, DeploymentStatus, TransitionDetails, User};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("domain {0} is already taken")]
    DomainTaken(String),

    #[error("email {0} is already registered")]
    EmailTaken(String),

    #[error("deployment {0} not found")]
    DeploymentNotFound(Uuid),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("user deletion is not supported")]
    UserDeletionUnsupported,
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(inner) => Self::Sled(inner),
        }
    }
}

fn abort(err: StorageError) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err)
}

#[derive(Clone)] // Sled handles are cheap to clone and thread-safe
pub struct Storage {
    db: Db,
    users: sled::Tree,
    deployments: sled::Tree,
    domains: sled::Tree,
}

impl Storage {
    /// Open or create the Sled database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop; used by tests and dry runs.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let users = db.open_tree("users")?;
        let deployments = db.open_tree("deployments")?;
        let domains = db.open_tree("domains")?;
        Ok(Self {
            db,
            users,
            deployments,
            domains,
        })
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }

    // --- Users ---

    /// Insert a user if no account with the same email exists.
    pub fn create_user(&self, user: &User) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(user)?;
        self.users
            .compare_and_swap(user.email.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| StorageError::EmailTaken(user.email.clone()))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        match self.users.get(email.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Users own deployments and nothing defines what happens to them when
    /// the owner goes away, so removal is refused outright.
    pub fn delete_user(&self, email: &str) -> Result<(), StorageError> {
        if self.users.get(email.as_bytes())?.is_none() {
            return Err(StorageError::UserNotFound(email.to_string()));
        }
        Err(StorageError::UserDeletionUnsupported)
    }

    // --- Deployments ---

    /// Atomically claim the domain and persist the record.
    pub fn create_deployment(&self, deployment: &Deployment) -> Result<(), StorageError> {
        let key = deployment.id.to_string();
        let domain = deployment.domain.as_str();
        let bytes = serde_json::to_vec(deployment)?;

        (&self.domains, &self.deployments).transaction(|(domains, deployments)| {
            if domains.get(domain.as_bytes())?.is_some() {
                return Err(abort(StorageError::DomainTaken(domain.to_string())));
            }
            domains.insert(domain.as_bytes(), key.as_bytes())?;
            deployments.insert(key.as_bytes(), bytes.as_slice())?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>, StorageError> {
        match self.deployments.get(id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a deployment only if `owner` owns it; foreign records read as absent.
    pub fn get_deployment_for(&self, owner: Uuid, id: Uuid) -> Result<Deployment, StorageError> {
        self.get_deployment(id)?
            .filter(|d| d.owner_id == owner)
            .ok_or(StorageError::DeploymentNotFound(id))
    }

    pub fn find_by_domain(&self, domain: &str) -> Result<Option<Deployment>, StorageError> {
        let Some(key) = self.domains.get(domain.as_bytes())? else {
            return Ok(None);
        };
        match self.deployments.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All deployments owned by `owner`, newest first.
    pub fn list_deployments_for(&self, owner: Uuid) -> Result<Vec<Deployment>, StorageError> {
        let mut out = Vec::new();
        for item in self.deployments.iter() {
            let (_, bytes) = item?;
            let deployment: Deployment = serde_json::from_slice(&bytes)?;
            if deployment.owner_id == owner {
                out.push(deployment);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Deployments still `building` or `deploying`, any owner.
    pub fn list_in_flight(&self) -> Result<Vec<Deployment>, StorageError> {
        let mut out = Vec::new();
        for item in self.deployments.iter() {
            let (_, bytes) = item?;
            let deployment: Deployment = serde_json::from_slice(&bytes)?;
            if !deployment.status.is_terminal() {
                out.push(deployment);
            }
        }
        Ok(out)
    }

    /// Remove a deployment owned by `owner` together with its domain claim.
    pub fn delete_deployment_for(&self, owner: Uuid, id: Uuid) -> Result<Deployment, StorageError> {
        let key = id.to_string();

        let removed = (&self.domains, &self.deployments).transaction(|(domains, deployments)| {
            let bytes = deployments
                .get(key.as_bytes())?
                .ok_or_else(|| abort(StorageError::DeploymentNotFound(id)))?;
            let deployment: Deployment =
                serde_json::from_slice(&bytes).map_err(|e| abort(e.into()))?;
            if deployment.owner_id != owner {
                return Err(abort(StorageError::DeploymentNotFound(id)));
            }
            deployments.remove(key.as_bytes())?;
            domains.remove(deployment.domain.as_bytes())?;
            Ok(deployment)
        })?;
        Ok(removed)
    }

    /// Move a deployment to `next`, refusing anything but a forward step.
    pub fn transition(
        &self,
        id: Uuid,
        next: DeploymentStatus,
        details: TransitionDetails,
    ) -> Result<Deployment, StorageError> {
        let key = id.to_string();

        let updated = self.deployments.transaction(|tx| {
            let bytes = tx
                .get(key.as_bytes())?
                .ok_or_else(|| abort(StorageError::DeploymentNotFound(id)))?;
            let mut deployment: Deployment =
                serde_json::from_slice(&bytes).map_err(|e| abort(e.into()))?;

            if !deployment.status.can_transition_to(next) {
                return Err(abort(StorageError::InvalidTransition {
                    from: deployment.status,
                    to: next,
                }));
            }

            deployment.status = next;
            deployment.updated_at = Utc::now();
            if let Some(site) = &details.provider_site_id {
                deployment.provider_site_id = Some(site.clone());
            }
            if let Some(deploy) = &details.provider_deploy_id {
                deployment.provider_deploy_id = Some(deploy.clone());
            }
            match next {
                DeploymentStatus::Live => {
                    let url = details.url.clone().unwrap_or_else(|| deployment.public_url());
                    deployment.ssl = url.starts_with("https://");
                    deployment.url = Some(url);
                    deployment.metrics.uptime_percent = 100.0;
                }
                DeploymentStatus::Error => {
                    deployment.error = details.error.clone();
                }
                DeploymentStatus::Building | DeploymentStatus::Deploying => {}
            }

            let encoded = serde_json::to_vec(&deployment).map_err(|e| abort(e.into()))?;
            tx.insert(key.as_bytes(), encoded)?;
            Ok(deployment)
        })?;
        Ok(updated)
    }
}
