use std::path::PathBuf;

use clap::Parser;
use reqwest::{Client, Url};
use reqwest_middleware::ClientBuilder;
use serde_json::json;
use tessera::{AuthConfig, AuthSession, CredentialStore, FileStorage};
use tessera_reqwest::{AuthSessionMiddleware, ReqwestTransport};

#[derive(Debug, Parser)]
struct Opts {
    /// The origin of the API server
    #[clap(short, long, env)]
    base_url: Url,

    /// The email address to sign in with
    #[clap(short, long, env)]
    email: String,

    /// The password to sign in with
    #[clap(short, long, env, hide_env_values = true)]
    password: String,

    /// A JSON file with session configuration
    #[clap(short, long, env)]
    config: Option<PathBuf>,

    /// The directory used to persist credentials
    #[clap(short = 'd', long, env, default_value = ".tessera")]
    credentials_dir: PathBuf,

    /// A protected resource to fetch once signed in
    #[clap(short, long, default_value = "/api/me")]
    resource: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => AuthConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => AuthConfig::default(),
    };

    let store = CredentialStore::new(FileStorage::new(&opts.credentials_dir));
    let builder = AuthSession::builder(config).with_store(store);

    let mut events = builder.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(event = event.name(), stage = ?event.stage(), "session event");
        }
    });

    let session = builder.start(ReqwestTransport::new(Client::new(), opts.base_url.clone()));

    let restored = match session.pending_operation() {
        Some(validation) => validation.await.is_ok(),
        None => session.is_authenticated(),
    };

    if restored {
        tracing::info!("restored previous session");
    } else {
        let payload = session
            .sign_in(&json!({ "email": opts.email, "password": opts.password }))
            .await?;
        tracing::info!(?payload, "signed in");
    }

    let client = ClientBuilder::new(Client::new())
        .with(AuthSessionMiddleware::new(session.clone()))
        .build();

    let response = client
        .get(opts.base_url.join(&opts.resource)?)
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await?;
    tracing::info!(%status, %body, "fetched protected resource");

    Ok(())
}
