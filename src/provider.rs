//! Hosting provider clients.
//!
//! The monitor only talks to [`HostingProvider`]. [`HttpProvider`] speaks the
//! third-party REST API; [`LocalProvider`] stands in when none is configured
//! and reports every site ready on the first poll.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// What the provider needs to publish a site.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub domain: String,
    pub project_name: String,
    /// Gzipped tarball of the staged files, if any were uploaded.
    pub archive: Option<Vec<u8>>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
}

/// Provider-side identifiers of a published site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSite {
    pub site_id: String,
    pub deploy_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Pending,
    Ready,
    Failed(String),
}

#[async_trait]
pub trait HostingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the site and start a deploy of the given artifact.
    async fn publish(&self, request: PublishRequest) -> Result<PublishedSite, ProviderError>;

    /// Current state of a deploy started by [`HostingProvider::publish`].
    async fn status(&self, site: &PublishedSite) -> Result<ProviderStatus, ProviderError>;
}

#[derive(Debug, Default, Clone)]
pub struct LocalProvider;

#[async_trait]
impl HostingProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishedSite, ProviderError> {
        Ok(PublishedSite {
            site_id: format!("local-{}", request.domain),
            deploy_id: format!("local-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn status(&self, _site: &PublishedSite) -> Result<ProviderStatus, ProviderError> {
        Ok(ProviderStatus::Ready)
    }
}

#[derive(Serialize)]
struct CreateSiteBody<'a> {
    name: &'a str,
    custom_domain: &'a str,
}

#[derive(Serialize)]
struct RepoDeployBody<'a> {
    repo_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
}

#[derive(Deserialize)]
struct SiteResponse {
    id: String,
}

#[derive(Deserialize)]
struct DeployResponse {
    id: String,
    state: String,
    #[serde(default)]
    error_message: Option<String>,
}

/// REST client for the external hosting API.
#[derive(Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpProvider {
    /// Every request carries `config.timeout`, so a provider that accepts the
    /// connection and never answers surfaces as an error instead of a hang.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.api_url.clone(),
            token: config.token.clone(),
        })
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::Status { status, body })
        }
    }
}

fn map_state(deploy: DeployResponse) -> ProviderStatus {
    match deploy.state.as_str() {
        "ready" => ProviderStatus::Ready,
        "error" => ProviderStatus::Failed(
            deploy
                .error_message
                .unwrap_or_else(|| format!("provider deploy {} failed", deploy.id)),
        ),
        _ => ProviderStatus::Pending,
    }
}

#[async_trait]
impl HostingProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishedSite, ProviderError> {
        let site: SiteResponse = Self::checked(
            self.client
                .post(format!("{}/sites", self.base_url))
                .bearer_auth(&self.token)
                .json(&CreateSiteBody {
                    name: &request.project_name,
                    custom_domain: &request.domain,
                })
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        tracing::debug!(site_id = %site.id, domain = %request.domain, "provider site created");

        let deploys_url = format!("{}/sites/{}/deploys", self.base_url, site.id);
        let builder = match (&request.archive, &request.repo_url) {
            (Some(archive), _) => self
                .client
                .post(deploys_url)
                .header(header::CONTENT_TYPE, "application/gzip")
                .body(archive.clone()),
            (None, Some(repo_url)) => self.client.post(deploys_url).json(&RepoDeployBody {
                repo_url,
                branch: request.branch.as_deref(),
            }),
            (None, None) => self.client.post(deploys_url),
        };
        let deploy: DeployResponse = Self::checked(builder.bearer_auth(&self.token).send().await?)
            .await?
            .json()
            .await?;

        Ok(PublishedSite {
            site_id: site.id,
            deploy_id: deploy.id,
        })
    }

    async fn status(&self, site: &PublishedSite) -> Result<ProviderStatus, ProviderError> {
        let deploy: DeployResponse = Self::checked(
            self.client
                .get(format!("{}/deploys/{}", self.base_url, site.deploy_id))
                .bearer_auth(&self.token)
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(map_state(deploy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::extract::{Request, State};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        auth: Option<String>,
        content_type: Option<String>,
        body: Vec<u8>,
    }

    type RequestLog = Arc<Mutex<Vec<Seen>>>;

    /// Minimal hosting API: records every request and answers like the real one.
    async fn hosting_api(State(seen): State<RequestLog>, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let get = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let entry = Seen {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            auth: get(header::AUTHORIZATION),
            content_type: get(header::CONTENT_TYPE),
            body: to_bytes(body, usize::MAX).await.unwrap().to_vec(),
        };
        let reply = match (entry.method.as_str(), entry.path.as_str()) {
            ("POST", "/sites") => json!({ "id": "site-9" }),
            ("POST", "/sites/site-9/deploys") => json!({ "id": "dep-1", "state": "uploading" }),
            ("GET", "/deploys/dep-1") => json!({ "id": "dep-1", "state": "ready" }),
            _ => return axum::http::StatusCode::NOT_FOUND.into_response(),
        };
        seen.lock().unwrap().push(entry);
        Json(reply).into_response()
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn provider_with_log() -> (HttpProvider, RequestLog) {
        let seen = RequestLog::default();
        let base = serve(Router::new().fallback(hosting_api).with_state(seen.clone())).await;
        let provider = HttpProvider::new(&ProviderConfig {
            api_url: base,
            token: "tok".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        (provider, seen)
    }

    fn request(archive: Option<Vec<u8>>, repo_url: Option<&str>) -> PublishRequest {
        PublishRequest {
            domain: "demo.ntl.cloud".to_string(),
            project_name: "demo".to_string(),
            archive,
            repo_url: repo_url.map(str::to_string),
            branch: repo_url.map(|_| "main".to_string()),
        }
    }

    #[tokio::test]
    async fn http_provider_uploads_archive_and_polls_deploy() {
        let (provider, seen) = provider_with_log().await;

        let site = provider.publish(request(Some(vec![0x1f, 0x8b, 7]), None)).await.unwrap();
        assert_eq!(
            site,
            PublishedSite {
                site_id: "site-9".to_string(),
                deploy_id: "dep-1".to_string(),
            }
        );
        assert_eq!(provider.status(&site).await.unwrap(), ProviderStatus::Ready);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|s| s.auth.as_deref() == Some("Bearer tok")));

        let create: serde_json::Value = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(create, json!({ "name": "demo", "custom_domain": "demo.ntl.cloud" }));

        assert_eq!(seen[1].path, "/sites/site-9/deploys");
        assert_eq!(seen[1].content_type.as_deref(), Some("application/gzip"));
        assert_eq!(seen[1].body, vec![0x1f, 0x8b, 7]);

        assert_eq!((seen[2].method.as_str(), seen[2].path.as_str()), ("GET", "/deploys/dep-1"));
    }

    #[tokio::test]
    async fn http_provider_sends_repo_reference_as_json() {
        let (provider, seen) = provider_with_log().await;

        provider
            .publish(request(None, Some("https://github.com/acme/site")))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[1].content_type.as_deref(), Some("application/json"));
        let body: serde_json::Value = serde_json::from_slice(&seen[1].body).unwrap();
        assert_eq!(body, json!({ "repo_url": "https://github.com/acme/site", "branch": "main" }));
    }

    #[tokio::test]
    async fn non_success_reply_is_a_status_error() {
        let base = serve(Router::new().fallback(|| async {
            (axum::http::StatusCode::BAD_GATEWAY, "upstream down")
        }))
        .await;
        let provider = HttpProvider::new(&ProviderConfig {
            api_url: base,
            token: "tok".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        match provider.publish(request(Some(vec![1]), None)).await {
            Err(ProviderError::Status { status, body }) => {
                assert_eq!(status, StatusCode::BAD_GATEWAY);
                assert_eq!(body, "upstream down");
            }
            other => panic!("expected a status error, got {other:?}"),
        }
    }

    fn deploy(state: &str, error: Option<&str>) -> DeployResponse {
        DeployResponse {
            id: "d1".to_string(),
            state: state.to_string(),
            error_message: error.map(str::to_string),
        }
    }

    #[test]
    fn provider_states_map_to_lifecycle() {
        assert_eq!(map_state(deploy("ready", None)), ProviderStatus::Ready);
        assert_eq!(map_state(deploy("building", None)), ProviderStatus::Pending);
        assert_eq!(map_state(deploy("uploading", None)), ProviderStatus::Pending);
        assert_eq!(
            map_state(deploy("error", Some("bad build"))),
            ProviderStatus::Failed("bad build".to_string())
        );
        assert_eq!(
            map_state(deploy("error", None)),
            ProviderStatus::Failed("provider deploy d1 failed".to_string())
        );
    }

    #[tokio::test]
    async fn local_provider_is_ready_immediately() {
        let provider = LocalProvider;
        let site = provider
            .publish(PublishRequest {
                domain: "demo.ntl.cloud".to_string(),
                project_name: "demo".to_string(),
                archive: None,
                repo_url: None,
                branch: None,
            })
            .await
            .unwrap();
        assert_eq!(site.site_id, "local-demo.ntl.cloud");
        assert_eq!(provider.status(&site).await.unwrap(), ProviderStatus::Ready);
    }
}
