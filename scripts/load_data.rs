//! Seed script for ntl_cloud
//!
//! Creates a demo account and one live deployment so the dashboard and the
//! `ntl` client have something to show on a fresh data directory.
//! Run: cargo run --bin load_data
//! Safe to re-run: existing records are left alone.

use ntl_cloud::auth::hash_password;
use ntl_cloud::config::Config;
use ntl_cloud::models::{Deployment, DeploymentStatus, NewDeployment, TransitionDetails, User};
use ntl_cloud::storage::{Storage, StorageError};

const DEMO_EMAIL: &str = "demo@ntl.cloud";
const DEMO_PASSWORD: &str = "demo-password";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let _log_guard = ntl_cloud::logging::init(&config);
    config.log_warnings();
    let storage = Storage::open(&config.data_dir)?;

    let user = User::new(
        DEMO_EMAIL,
        Some("Demo User".to_string()),
        hash_password(DEMO_PASSWORD)?,
    );
    let user = match storage.create_user(&user) {
        Ok(()) => {
            println!("Created user {DEMO_EMAIL}");
            user
        }
        Err(StorageError::EmailTaken(_)) => {
            println!("User {DEMO_EMAIL} already exists");
            storage
                .get_user_by_email(DEMO_EMAIL)?
                .ok_or("demo user vanished while seeding")?
        }
        Err(err) => return Err(err.into()),
    };

    let domain = format!("demo.{}", config.base_domain);
    if storage.find_by_domain(&domain)?.is_some() {
        println!("Deployment for {domain} already exists");
    } else {
        let deployment = Deployment::create(NewDeployment {
            owner_id: user.id,
            domain: domain.clone(),
            project_name: "demo".to_string(),
            repo_url: Some("https://github.com/ntl-cloud/demo-site".to_string()),
            branch: Some("main".to_string()),
            build_command: None,
            output_dir: ".".to_string(),
        });
        storage.create_deployment(&deployment)?;
        storage.transition(deployment.id, DeploymentStatus::Deploying, TransitionDetails::default())?;
        let live = storage.transition(
            deployment.id,
            DeploymentStatus::Live,
            TransitionDetails {
                provider_site_id: Some("local-demo".to_string()),
                ..TransitionDetails::default()
            },
        )?;
        println!(
            "Created deployment {} ({}) at {}",
            live.id,
            live.status,
            live.url.as_deref().unwrap_or("-")
        );
    }

    storage.flush().await?;
    println!("Seeded {}. Log in with {DEMO_EMAIL} / {DEMO_PASSWORD}", config.data_dir.display());
    Ok(())
}
