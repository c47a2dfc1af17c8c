//! Drives a deployment from `building` to a terminal state.
//!
//! One task per in-flight deployment: mark it `deploying`, hand the staged
//! files to the hosting provider, then poll the provider at a fixed interval
//! for at most `max_attempts` polls. Running out of attempts ends in `error`.
//! There is no cancellation; a deployment deleted mid-flight stops its task at
//! the next transition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::PollPolicy;
use crate::models::{Deployment, DeploymentStatus, TransitionDetails};
use crate::packaging::{self, PackagingError};
use crate::provider::{HostingProvider, ProviderStatus, PublishRequest, PublishedSite};
use crate::storage::{Storage, StorageError};

/// Receives every deployment that reaches a terminal state.
pub trait Notifier: Send + Sync {
    fn notify(&self, deployment: &Deployment);
}

/// Default notifier: a log line, nothing is sent anywhere.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, deployment: &Deployment) {
        info!(
            deployment_id = %deployment.id,
            domain = %deployment.domain,
            status = %deployment.status,
            url = deployment.url.as_deref().unwrap_or(""),
            "deployment finished"
        );
    }
}

#[derive(Clone)]
pub struct DeploymentMonitor {
    storage: Storage,
    provider: Arc<dyn HostingProvider>,
    notifier: Arc<dyn Notifier>,
    policy: PollPolicy,
    upload_dir: PathBuf,
}

impl DeploymentMonitor {
    pub fn new(
        storage: Storage,
        provider: Arc<dyn HostingProvider>,
        notifier: Arc<dyn Notifier>,
        policy: PollPolicy,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            storage,
            provider,
            notifier,
            policy,
            upload_dir,
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Directory holding the staged files of one deployment.
    pub fn staging_dir(&self, id: Uuid) -> PathBuf {
        self.upload_dir.join(id.to_string())
    }

    /// Run the lifecycle in the background.
    pub fn spawn(&self, id: Uuid) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor.run(id).await {
                match err {
                    StorageError::DeploymentNotFound(_) => {
                        info!(deployment_id = %id, "deployment removed while in flight")
                    }
                    other => warn!(deployment_id = %id, error = %other, "deployment monitor stopped"),
                }
            }
        })
    }

    /// Pick up deployments left in flight by a previous process.
    ///
    /// `building` ones still have their staged files and are started again;
    /// `deploying` ones lost their provider handle and are failed.
    pub fn recover(&self) -> Result<usize, StorageError> {
        let pending = self.storage.list_in_flight()?;
        let count = pending.len();
        for deployment in pending {
            match deployment.status {
                DeploymentStatus::Building => {
                    self.spawn(deployment.id);
                }
                _ => {
                    self.mark_failed(deployment.id, "interrupted by server restart")?;
                }
            }
        }
        if count > 0 {
            info!(count, "recovered in-flight deployments");
        }
        Ok(count)
    }

    /// Record a failure that happened before the monitor could start.
    pub fn mark_failed(&self, id: Uuid, message: impl Into<String>) -> Result<Deployment, StorageError> {
        let failed = self
            .storage
            .transition(id, DeploymentStatus::Error, TransitionDetails::failed(message))?;
        self.notifier.notify(&failed);
        Ok(failed)
    }

    /// Drive one deployment to `live` or `error` and return the final record.
    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn run(&self, id: Uuid) -> Result<Deployment, StorageError> {
        let deployment = self
            .storage
            .transition(id, DeploymentStatus::Deploying, TransitionDetails::default())?;
        info!(domain = %deployment.domain, "deploying");

        let archive = match self.package(id).await {
            Ok(archive) => archive,
            Err(err) => return self.finish_failed(id, None, format!("packaging failed: {err}")),
        };

        let request = PublishRequest {
            domain: deployment.domain.clone(),
            project_name: deployment.project_name.clone(),
            archive,
            repo_url: deployment.repo_url.clone(),
            branch: deployment.branch.clone(),
        };
        let site = match self.provider.publish(request).await {
            Ok(site) => site,
            Err(err) => {
                warn!(error = %err, "provider publish failed");
                return self.finish_failed(id, None, format!("provider publish failed: {err}"));
            }
        };

        for attempt in 1..=self.policy.max_attempts {
            tokio::time::sleep(self.policy.interval).await;

            match self.provider.status(&site).await {
                Ok(ProviderStatus::Ready) => {
                    info!(attempt, "provider reports ready");
                    return self.finish_live(id, &site);
                }
                Ok(ProviderStatus::Failed(reason)) => {
                    return self.finish_failed(id, Some(&site), reason);
                }
                Ok(ProviderStatus::Pending) => {
                    tracing::debug!(attempt, max = self.policy.max_attempts, "still pending");
                }
                Err(err) => {
                    warn!(attempt, error = %err, "provider status check failed");
                    return self.finish_failed(id, Some(&site), format!("status check failed: {err}"));
                }
            }
        }

        self.finish_failed(
            id,
            Some(&site),
            format!("status polling exhausted after {} attempts", self.policy.max_attempts),
        )
    }

    async fn package(&self, id: Uuid) -> Result<Option<Vec<u8>>, PackagingError> {
        let dir = self.staging_dir(id);
        tokio::task::spawn_blocking(move || pack_if_staged(&dir))
            .await
            .map_err(|e| PackagingError::Io(std::io::Error::other(e)))?
    }

    fn finish_live(&self, id: Uuid, site: &PublishedSite) -> Result<Deployment, StorageError> {
        let live = self.storage.transition(
            id,
            DeploymentStatus::Live,
            TransitionDetails {
                provider_site_id: Some(site.site_id.clone()),
                provider_deploy_id: Some(site.deploy_id.clone()),
                ..TransitionDetails::default()
            },
        )?;
        self.notifier.notify(&live);
        Ok(live)
    }

    fn finish_failed(
        &self,
        id: Uuid,
        site: Option<&PublishedSite>,
        message: String,
    ) -> Result<Deployment, StorageError> {
        let failed = self.storage.transition(
            id,
            DeploymentStatus::Error,
            TransitionDetails {
                provider_site_id: site.map(|s| s.site_id.clone()),
                provider_deploy_id: site.map(|s| s.deploy_id.clone()),
                error: Some(message),
                ..TransitionDetails::default()
            },
        )?;
        self.notifier.notify(&failed);
        Ok(failed)
    }
}

fn pack_if_staged(dir: &Path) -> Result<Option<Vec<u8>>, PackagingError> {
    if packaging::list_files(dir)?.is_empty() {
        return Ok(None);
    }
    packaging::pack_dir(dir).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewDeployment;
    use crate::config::ProviderConfig;
    use crate::provider::{HttpProvider, ProviderError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted statuses, then reports pending forever.
    #[derive(Default)]
    struct ScriptedProvider {
        statuses: Mutex<VecDeque<ProviderStatus>>,
        fail_publish: bool,
        polls: AtomicU32,
        archives: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl ScriptedProvider {
        fn with(statuses: Vec<ProviderStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl HostingProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn publish(&self, request: PublishRequest) -> Result<PublishedSite, ProviderError> {
            if self.fail_publish {
                return Err(ProviderError::Status {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "upstream down".to_string(),
                });
            }
            self.archives.lock().unwrap().push(request.archive);
            Ok(PublishedSite {
                site_id: "site-1".to_string(),
                deploy_id: "deploy-1".to_string(),
            })
        }

        async fn status(&self, _site: &PublishedSite) -> Result<ProviderStatus, ProviderError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProviderStatus::Pending))
        }
    }

    struct Fixture {
        storage: Storage,
        monitor: DeploymentMonitor,
        provider: Arc<ScriptedProvider>,
        _uploads: tempfile::TempDir,
    }

    fn fixture(provider: ScriptedProvider, max_attempts: u32) -> Fixture {
        let storage = Storage::temporary().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);
        let monitor = DeploymentMonitor::new(
            storage.clone(),
            provider.clone(),
            Arc::new(LogNotifier),
            PollPolicy {
                interval: Duration::from_millis(1),
                max_attempts,
            },
            uploads.path().to_path_buf(),
        );
        Fixture {
            storage,
            monitor,
            provider,
            _uploads: uploads,
        }
    }

    fn create(storage: &Storage, domain: &str) -> Deployment {
        let d = Deployment::create(NewDeployment {
            owner_id: Uuid::new_v4(),
            domain: domain.to_string(),
            project_name: "demo".to_string(),
            repo_url: None,
            branch: None,
            build_command: None,
            output_dir: ".".to_string(),
        });
        storage.create_deployment(&d).unwrap();
        d
    }

    #[tokio::test]
    async fn ready_after_pending_goes_live() {
        let f = fixture(
            ScriptedProvider::with(vec![ProviderStatus::Pending, ProviderStatus::Ready]),
            5,
        );
        let d = create(&f.storage, "demo.ntl.cloud");
        std::fs::create_dir_all(f.monitor.staging_dir(d.id)).unwrap();
        std::fs::write(f.monitor.staging_dir(d.id).join("index.html"), "hi").unwrap();

        let done = f.monitor.run(d.id).await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Live);
        assert_eq!(done.url.as_deref(), Some("https://demo.ntl.cloud"));
        assert_eq!(done.provider_deploy_id.as_deref(), Some("deploy-1"));
        assert_eq!(f.provider.polls.load(Ordering::SeqCst), 2);
        assert!(f.provider.archives.lock().unwrap()[0].is_some());
    }

    #[tokio::test]
    async fn exhausted_budget_ends_in_error() {
        let f = fixture(ScriptedProvider::default(), 3);
        let d = create(&f.storage, "slow.ntl.cloud");

        let done = f.monitor.run(d.id).await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Error);
        assert_eq!(
            done.error.as_deref(),
            Some("status polling exhausted after 3 attempts")
        );
        assert_eq!(f.provider.polls.load(Ordering::SeqCst), 3);
        assert!(f.provider.archives.lock().unwrap()[0].is_none());
    }

    #[tokio::test]
    async fn provider_failure_ends_in_error() {
        let f = fixture(
            ScriptedProvider::with(vec![ProviderStatus::Failed("build broke".to_string())]),
            5,
        );
        let d = create(&f.storage, "broken.ntl.cloud");

        let done = f.monitor.run(d.id).await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Error);
        assert_eq!(done.error.as_deref(), Some("build broke"));
        assert!(done.url.is_none());
    }

    #[tokio::test]
    async fn publish_failure_ends_in_error_without_polling() {
        let f = fixture(
            ScriptedProvider {
                fail_publish: true,
                ..ScriptedProvider::default()
            },
            5,
        );
        let d = create(&f.storage, "down.ntl.cloud");

        let done = f.monitor.run(d.id).await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Error);
        assert_eq!(f.provider.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn terminal_deployment_is_not_rerun() {
        let f = fixture(ScriptedProvider::with(vec![ProviderStatus::Ready]), 5);
        let d = create(&f.storage, "once.ntl.cloud");
        f.monitor.run(d.id).await.unwrap();

        let err = f.monitor.run(d.id).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition { .. }));
        let stored = f.storage.get_deployment(d.id).unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Live);
    }

    #[tokio::test]
    async fn deleted_deployment_stops_monitor() {
        let f = fixture(ScriptedProvider::default(), 50);
        let d = create(&f.storage, "gone.ntl.cloud");
        let handle = f.monitor.spawn(d.id);
        f.storage.delete_deployment_for(d.owner_id, d.id).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
        assert!(f.storage.get_deployment(d.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn unresponsive_provider_still_ends_in_error() {
        // Accepts connections and never writes a byte.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let provider = HttpProvider::new(&ProviderConfig {
            api_url: format!("http://{addr}"),
            token: "tok".to_string(),
            timeout: Duration::from_millis(200),
        })
        .unwrap();
        let storage = Storage::temporary().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        let monitor = DeploymentMonitor::new(
            storage.clone(),
            Arc::new(provider),
            Arc::new(LogNotifier),
            PollPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 2,
            },
            uploads.path().to_path_buf(),
        );
        let d = create(&storage, "silent.ntl.cloud");

        let done = tokio::time::timeout(Duration::from_secs(10), monitor.run(d.id))
            .await
            .expect("provider timeout should end the run")
            .unwrap();
        assert_eq!(done.status, DeploymentStatus::Error);
        assert!(done
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("provider publish failed")));
    }

    #[tokio::test]
    async fn recover_restarts_building_and_fails_deploying() {
        let f = fixture(ScriptedProvider::with(vec![ProviderStatus::Ready]), 5);
        let fresh = create(&f.storage, "fresh.ntl.cloud");
        let stuck = create(&f.storage, "stuck.ntl.cloud");
        f.storage
            .transition(stuck.id, DeploymentStatus::Deploying, TransitionDetails::default())
            .unwrap();

        assert_eq!(f.monitor.recover().unwrap(), 2);

        let stuck = f.storage.get_deployment(stuck.id).unwrap().unwrap();
        assert_eq!(stuck.status, DeploymentStatus::Error);
        assert_eq!(stuck.error.as_deref(), Some("interrupted by server restart"));

        let live = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let d = f.storage.get_deployment(fresh.id).unwrap().unwrap();
                if d.status.is_terminal() {
                    return d;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recovered deployment should finish");
        assert_eq!(live.status, DeploymentStatus::Live);
        assert!(f.storage.list_in_flight().unwrap().is_empty());
    }
}
