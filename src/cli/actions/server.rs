use crate::{
    api::{self, AppState},
    auth::{
        basic::BasicBroker,
        oidc::{
            client::{http_client, HttpOAuthClient, ProviderMetadata},
            verifier::JwksVerifier,
            OidcBroker,
        },
        static_broker::StaticBroker,
        Broker, Registry,
    },
    cli::commands::{basic, oidc, static_users, sync},
    session::MemorySessionStore,
    sync::{
        store::{
            file::FileStore,
            kv::{InMemoryKeyValue, KeyValueSyncStore},
            memory::MemoryStore,
            noop::NoopStore,
        },
        SessionSynchronizer, Store,
    },
};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub base_url: Url,
    pub session_ttl: Duration,
    pub oidc: Option<oidc::Options>,
    pub basic: Option<basic::Options>,
    pub static_users: Option<static_users::Options>,
    pub sync: Option<sync::Options>,
}

/// Execute the server action.
/// # Errors
/// Returns an error if provider discovery fails, a store cannot be opened, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let sessions = Arc::new(MemorySessionStore::new(args.session_ttl));

    let mut brokers = Vec::new();
    if let Some(options) = args.oidc {
        brokers.push(oidc_broker(options).await?);
    }
    brokers.extend(local_brokers(args.static_users, args.basic));

    let mut registry = Registry::new(brokers)?;
    if let Some(options) = &args.sync {
        let store = sync_store(&options.backend, sessions.clone()).await?;
        registry = registry
            .with_synchronizer(Arc::new(SessionSynchronizer::new(store)))
            .with_failure_policy(options.failure_policy);
    }
    debug!("Registered brokers: {:?}", registry.broker_names());

    let state = AppState::new(Arc::new(registry), sessions, args.base_url);

    api::serve(args.port, state).await
}

async fn oidc_broker(options: oidc::Options) -> Result<Arc<dyn Broker>> {
    let http = http_client().context("Could not build HTTP client")?;
    let metadata = ProviderMetadata::discover(&http, &options.issuer)
        .await
        .with_context(|| format!("OpenID provider discovery failed for {}", options.issuer))?;

    let verifier = JwksVerifier::remote(
        http.clone(),
        metadata.jwks_uri.clone(),
        metadata.issuer.clone(),
        options.client_id.clone(),
    );
    let client = HttpOAuthClient::new(http, metadata, options.client_id, options.client_secret);

    Ok(Arc::new(OidcBroker::new(
        options.config,
        Arc::new(client),
        Arc::new(verifier),
    )))
}

fn local_brokers(
    static_users: Option<static_users::Options>,
    basic: Option<basic::Options>,
) -> Vec<Arc<dyn Broker>> {
    let mut brokers: Vec<Arc<dyn Broker>> = Vec::new();
    if let Some(options) = static_users {
        brokers.push(Arc::new(StaticBroker::new(options.broker, options.users)));
    }
    if let Some(options) = basic {
        brokers.push(Arc::new(
            BasicBroker::new(options.broker, options.users).with_realm(options.realm),
        ));
    }
    brokers
}

async fn sync_store(
    backend: &sync::Backend,
    sessions: Arc<MemorySessionStore>,
) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match backend {
        sync::Backend::Noop => Arc::new(NoopStore),
        sync::Backend::Memory => Arc::new(MemoryStore::new(sessions)),
        sync::Backend::KeyValue { max_age } => Arc::new(
            KeyValueSyncStore::new(Arc::new(InMemoryKeyValue::new()))
                .with_max_age(*max_age)
                .with_sessions(sessions),
        ),
        sync::Backend::File { path } => Arc::new(
            FileStore::open(path)
                .await
                .with_context(|| format!("Could not open sync directory {}", path.display()))?
                .with_sessions(sessions),
        ),
    };
    Ok(store)
}

fn log_startup_args(args: &Args) {
    let brokers: Vec<String> = [
        args.oidc.as_ref().map(|o| format!("{} (oidc)", o.config.broker())),
        args.static_users
            .as_ref()
            .map(|s| format!("{} (static)", s.broker)),
        args.basic.as_ref().map(|b| format!("{} (basic)", b.broker)),
    ]
    .into_iter()
    .flatten()
    .collect();

    let single_session = args.sync.as_ref().map_or_else(
        || "disabled".to_string(),
        |options| format!("{} (fail-{})", backend_name(&options.backend), options.failure_policy),
    );

    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("base_url", args.base_url.to_string()),
        ("session_ttl", format!("{}s", args.session_ttl.as_secs())),
        ("brokers", brokers.join(", ")),
        (
            "oidc_issuer",
            args.oidc
                .as_ref()
                .map_or_else(|| "n/a".to_string(), |o| o.issuer.clone()),
        ),
        ("single_session", single_session),
    ];
    log_entries("Startup configuration", &entries);
}

fn backend_name(backend: &sync::Backend) -> String {
    match backend {
        sync::Backend::Noop => "noop".to_string(),
        sync::Backend::Memory => "memory".to_string(),
        sync::Backend::KeyValue { max_age } => format!("kv, max-age {}s", max_age.as_secs()),
        sync::Backend::File { path } => format!("file:{}", path.display()),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn banner() -> String {
    let short_hash = short_commit(crate::GIT_COMMIT_HASH);
    BANNER.replace(
        "{VERSION}",
        &format!(" - {} - {}", env!("CARGO_PKG_VERSION"), short_hash),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}

const BANNER: &str = r"
   .-----.
  / .---. \
  | |   | |
 _|_|___|_|_
|    (o)    |  A U T H B R O K E R {VERSION}
|     |     |
|___________|";
