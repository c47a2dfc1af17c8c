use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use ntl_cloud::models::{Deployment, DeploymentStatus};
use ntl_cloud::packaging::{self, PackagingError};
use ntl_cloud::rest::{AuthResponse, DeployResponse, MessageResponse};

const PROJECT_FILE: &str = "ntl.json";
const STATUS_POLL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
enum CliError {
    #[error("Not logged in. Run `ntl login` first.")]
    NotLoggedIn,

    #[error("No domain given. Pass --domain or run `ntl init` to create {}.", PROJECT_FILE)]
    NoDomain,

    #[error("No deployment matches '{0}'")]
    NoMatch(String),

    #[error("'{0}' matches several deployments; use the domain or id instead")]
    Ambiguous(String),

    #[error("{0} already exists")]
    AlreadyInitialized(PathBuf),

    #[error("Invalid project name: {0}")]
    InvalidName(String),

    #[error("Build command failed: {0}")]
    BuildFailed(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(name = "ntl")]
#[command(about = "Deploy static sites to ntl.cloud", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, env = "NTL_API_URL", default_value = "http://localhost:3000")]
    api_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account
    Register {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Log in and store the token
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Forget the stored token
    Logout,
    /// Package and deploy a site
    Deploy {
        /// Domain, or a bare name under the platform domain
        #[arg(short, long)]
        domain: Option<String>,
        /// Project directory
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Deploy from a repository instead of local files
        #[arg(short, long)]
        repo: Option<String>,
        #[arg(short, long)]
        branch: Option<String>,
        /// Build command run before packaging
        #[arg(long)]
        build: Option<String>,
        /// Directory (inside the project) to publish
        #[arg(short, long)]
        output: Option<String>,
        /// Return as soon as the deployment is accepted
        #[arg(long)]
        no_wait: bool,
    },
    /// List your deployments
    List,
    /// Delete a deployment by project name, domain or id
    Delete { name: String },
    /// Show one deployment, or all of them
    Status { name: Option<String> },
    /// Scaffold ntl.json and a starter page
    Init { name: Option<String> },
}

/// Stored at `$HOME/.ntl/credentials.json`.
#[derive(Serialize, Deserialize)]
struct Credentials {
    api_url: String,
    token: String,
    email: String,
}

/// Per-project defaults stored in `ntl.json`.
#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProjectConfig {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_dir: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

fn credentials_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ntl").join("credentials.json")
}

fn load_credentials() -> Result<Credentials, CliError> {
    let raw = std::fs::read_to_string(credentials_path()).map_err(|_| CliError::NotLoggedIn)?;
    Ok(serde_json::from_str(&raw)?)
}

fn save_credentials(credentials: &Credentials) -> Result<(), CliError> {
    let path = credentials_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, serde_json::to_vec_pretty(credentials)?)?;
    Ok(())
}

fn load_project(dir: &Path) -> Result<Option<ProjectConfig>, CliError> {
    let path = dir.join(PROJECT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&std::fs::read_to_string(path)?)?))
}

/// Turn a non-2xx response into [`CliError::Api`], keeping the server's message.
async fn checked(response: Response) -> Result<Response, CliError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(CliError::Api {
        status: status.as_u16(),
        message,
    })
}

struct Api {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn new(base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    fn authenticated(base: &str) -> Result<Self, CliError> {
        let credentials = load_credentials()?;
        Ok(Self {
            token: Some(credentials.token),
            ..Self::new(base)
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn deployments(&self) -> Result<Vec<Deployment>, CliError> {
        let response = self.request(reqwest::Method::GET, "/api/deployments").send().await?;
        Ok(checked(response).await?.json().await?)
    }

    async fn deployment(&self, id: Uuid) -> Result<Deployment, CliError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/deployments/{id}"))
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    /// Find one deployment by id, domain or project name.
    async fn resolve(&self, name: &str) -> Result<Deployment, CliError> {
        let mut matches: Vec<Deployment> = self
            .deployments()
            .await?
            .into_iter()
            .filter(|d| d.id.to_string() == name || d.domain == name || d.project_name == name)
            .collect();
        match matches.len() {
            0 => Err(CliError::NoMatch(name.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(CliError::Ambiguous(name.to_string())),
        }
    }
}

async fn auth(api_url: &str, path: &str, body: serde_json::Value) -> Result<(), CliError> {
    let api = Api::new(api_url);
    let response = api.request(reqwest::Method::POST, path).json(&body).send().await?;
    let auth: AuthResponse = checked(response).await?.json().await?;
    save_credentials(&Credentials {
        api_url: api_url.to_string(),
        token: auth.token,
        email: auth.user.email.clone(),
    })?;
    println!("Logged in as {}. Token saved to {}", auth.user.email, credentials_path().display());
    Ok(())
}

struct DeployArgs {
    domain: Option<String>,
    path: Option<PathBuf>,
    repo: Option<String>,
    branch: Option<String>,
    build: Option<String>,
    output: Option<String>,
    no_wait: bool,
}

async fn run_build(dir: &Path, command: &str) -> Result<(), CliError> {
    println!("Running build: {command}");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .status()
        .await
        .map_err(|e| CliError::BuildFailed(e.to_string()))?;
    if !status.success() {
        return Err(CliError::BuildFailed(format!("`{command}` exited with {status}")));
    }
    Ok(())
}

async fn deploy(api_url: &str, args: DeployArgs) -> Result<(), CliError> {
    let api = Api::authenticated(api_url)?;
    let project_dir = args.path.clone().unwrap_or_else(|| PathBuf::from("."));
    let project = load_project(&project_dir)?.unwrap_or_default();

    let domain = args.domain.or(project.domain).ok_or(CliError::NoDomain)?;
    let build = args.build.or(project.build_command);
    let output = args.output.or(project.output_dir).unwrap_or_else(|| ".".to_string());
    let upload_files = args.repo.is_none() || args.path.is_some();

    let mut form = multipart::Form::new()
        .text("domain", domain.clone())
        .text("outputDir", output.clone());
    if !project.name.is_empty() {
        form = form.text("projectName", project.name.clone());
    }
    if let Some(repo) = args.repo {
        form = form.text("repoUrl", repo);
    }
    if let Some(branch) = args.branch {
        form = form.text("branch", branch);
    }
    if let Some(build) = &build {
        form = form.text("buildCommand", build.clone());
    }

    if upload_files {
        if let Some(command) = &build {
            run_build(&project_dir, command).await?;
        }
        let publish_dir = project_dir.join(&output);
        println!("Packaging {}", publish_dir.display());
        let archive = tokio::task::spawn_blocking(move || packaging::pack_dir(&publish_dir))
            .await
            .map_err(|e| CliError::Io(std::io::Error::other(e)))??;
        println!("Uploading {} KiB", archive.len() / 1024);
        form = form.part(
            "archive",
            multipart::Part::bytes(archive)
                .file_name("site.tar.gz")
                .mime_str("application/gzip")?,
        );
    }

    let response = api
        .request(reqwest::Method::POST, "/api/deploy")
        .multipart(form)
        .send()
        .await?;
    let accepted: DeployResponse = checked(response).await?.json().await?;
    println!("Deployment {} accepted for {}", accepted.deployment_id, accepted.domain);

    if args.no_wait {
        println!("Check progress with `ntl status {}`", accepted.domain);
        return Ok(());
    }

    let polls = accepted.estimated_seconds / STATUS_POLL.as_secs() + 5;
    let mut last = accepted.status;
    for _ in 0..polls {
        tokio::time::sleep(STATUS_POLL).await;
        let deployment = api.deployment(accepted.deployment_id).await?;
        if deployment.status != last {
            println!("  {} -> {}", last, deployment.status);
            last = deployment.status;
        }
        match deployment.status {
            DeploymentStatus::Live => {
                let url = deployment.url.clone().unwrap_or_else(|| deployment.public_url());
                println!("Live at {url}");
                return Ok(());
            }
            DeploymentStatus::Error => {
                return Err(CliError::Api {
                    status: 500,
                    message: deployment.error.unwrap_or_else(|| "deployment failed".to_string()),
                });
            }
            DeploymentStatus::Building | DeploymentStatus::Deploying => {}
        }
    }
    println!("Still {last}; check later with `ntl status {}`", accepted.domain);
    Ok(())
}

fn print_table(deployments: &[Deployment]) {
    if deployments.is_empty() {
        println!("No deployments yet. Run `ntl deploy`.");
        return;
    }
    println!("{:<20} {:<32} {:<10} URL", "PROJECT", "DOMAIN", "STATUS");
    for d in deployments {
        println!(
            "{:<20} {:<32} {:<10} {}",
            d.project_name,
            d.domain,
            d.status,
            d.url.as_deref().unwrap_or("-")
        );
    }
}

fn print_details(d: &Deployment) {
    println!("Project:  {}", d.project_name);
    println!("Id:       {}", d.id);
    println!("Domain:   {}", d.domain);
    println!("Status:   {}", d.status);
    if let Some(url) = &d.url {
        println!("URL:      {url} (ssl: {})", d.ssl);
    }
    if let Some(repo) = &d.repo_url {
        println!("Repo:     {repo} ({})", d.branch.as_deref().unwrap_or("default branch"));
    }
    if let Some(error) = &d.error {
        println!("Error:    {error}");
    }
    println!("Created:  {}", d.created_at.to_rfc3339());
    println!("Updated:  {}", d.updated_at.to_rfc3339());
}

fn validate_name(name: &str) -> Result<(), CliError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(CliError::InvalidName(format!(
            "'{name}' must be lowercase letters, digits and inner hyphens"
        )))
    }
}

const INDEX_HTML_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8">
    <title>{{name}}</title>
  </head>
  <body>
    <h1>{{name}}</h1>
    <p>Deployed with ntl.</p>
  </body>
</html>
"#;

fn init(name: Option<String>) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    let name = match name {
        Some(name) => name,
        None => cwd
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "site".to_string()),
    };
    validate_name(&name)?;

    let config_path = cwd.join(PROJECT_FILE);
    if config_path.exists() {
        return Err(CliError::AlreadyInitialized(config_path));
    }
    let config = ProjectConfig {
        name: name.clone(),
        domain: Some(name.clone()),
        build_command: None,
        output_dir: Some(".".to_string()),
    };
    std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

    let index = cwd.join("index.html");
    if !index.exists() {
        std::fs::write(&index, INDEX_HTML_TEMPLATE.replace("{{name}}", &name))?;
    }

    println!("Created {PROJECT_FILE} for '{name}'");
    println!();
    println!("Next steps:");
    println!("  ntl login --email you@example.com --password ...");
    println!("  ntl deploy");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let api_url = cli.api_url;

    match cli.command {
        Commands::Register { email, password, name } => {
            auth(
                &api_url,
                "/api/auth/register",
                json!({ "email": email, "password": password, "name": name }),
            )
            .await
        }
        Commands::Login { email, password } => {
            auth(
                &api_url,
                "/api/auth/login",
                json!({ "email": email, "password": password }),
            )
            .await
        }
        Commands::Logout => {
            match std::fs::remove_file(credentials_path()) {
                Ok(()) => println!("Logged out (token removed)."),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => println!("Not logged in."),
                Err(err) => return Err(err.into()),
            }
            Ok(())
        }
        Commands::Deploy {
            domain,
            path,
            repo,
            branch,
            build,
            output,
            no_wait,
        } => {
            deploy(
                &api_url,
                DeployArgs {
                    domain,
                    path,
                    repo,
                    branch,
                    build,
                    output,
                    no_wait,
                },
            )
            .await
        }
        Commands::List => {
            let api = Api::authenticated(&api_url)?;
            print_table(&api.deployments().await?);
            Ok(())
        }
        Commands::Delete { name } => {
            let api = Api::authenticated(&api_url)?;
            let target = api.resolve(&name).await?;
            let response = api
                .request(reqwest::Method::DELETE, &format!("/api/deployments/{}", target.id))
                .send()
                .await?;
            let body: MessageResponse = checked(response).await?.json().await?;
            println!("{}", body.message);
            Ok(())
        }
        Commands::Status { name } => {
            let api = Api::authenticated(&api_url)?;
            match name {
                Some(name) => print_details(&api.resolve(&name).await?),
                None => print_table(&api.deployments().await?),
            }
            Ok(())
        }
        Commands::Init { name } => init(name),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
