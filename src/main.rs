use anyhow::{Context, Result};
use axum::Router;
use blob_replicator::{
    config::{AppConfig, Mode, RecordDelivery},
    handlers::AppState,
    models::event::BlobEvent,
    routes,
    services::{
        azure::AzureBlobService,
        credentials::{CACHED_DELEGATION_LIFETIME, CachedCredentialProvider, CredentialProvider},
        identity::{
            ChainedIdentityResolver, CredentialSource, IdentityResolver, StaticTokenResolver,
        },
        orchestrator::{CopyOrchestrator, PollSettings},
        pipeline::ReplicationPipeline,
        recorder::{CompletionRecorder, QueuedCompletionRecorder, SqlCompletionRecorder, migrate},
        telemetry::{APP_INSIGHTS_ENDPOINT, AppInsightsSink, TelemetrySink},
        token_issuer::DelegationSasIssuer,
    },
};
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing_subscriber::EnvFilter;
use url::Url;

const APPLICATION_NAME: &str = "blob-replicator";
const RECORD_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting blob-replicator with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    if let Some(parent) = Path::new(
        db_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:"),
    )
    .parent()
    {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{db_url}`"))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Schema ---
    migrate(&db).await?;
    if mode == Mode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Shared collaborators ---
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(AppInsightsSink::spawn(
        http.clone(),
        Url::parse(APP_INSIGHTS_ENDPOINT)?,
        cfg.telemetry_key.clone(),
        APPLICATION_NAME.into(),
    ));
    let identity: Arc<dyn IdentityResolver> = match &cfg.access_token {
        Some(token) => {
            tracing::warn!("using a static access token instead of the credential chain");
            Arc::new(StaticTokenResolver::new(token.clone()))
        }
        None => Arc::new(ChainedIdentityResolver::from_sources(&CredentialSource::chain(
            cfg.tenant_id.as_deref(),
            cfg.client_id.as_deref(),
            cfg.client_secret.as_deref(),
        ))?),
    };

    let source = AzureBlobService::new(
        http.clone(),
        &cfg.source_uri,
        cfg.source_account.clone(),
        identity.clone(),
    )?;
    let target = AzureBlobService::new(
        http.clone(),
        &cfg.target_uri,
        account_from_uri(&cfg.target_uri)?,
        identity,
    )?;

    let credentials: Arc<dyn CredentialProvider> = if cfg.cache_delegation_key {
        let keys = source.clone().with_key_lifetime(CACHED_DELEGATION_LIFETIME);
        Arc::new(CachedCredentialProvider::new(Arc::new(keys)))
    } else {
        Arc::new(source.clone())
    };
    let issuer = DelegationSasIssuer::new(credentials, cfg.source_account.clone());
    let orchestrator = CopyOrchestrator::new(
        Arc::new(issuer),
        PollSettings {
            interval: cfg.copy_poll,
            ..PollSettings::default()
        },
    );

    let records = SqlCompletionRecorder::new(db.clone(), cfg.record_mode);
    let (recorder, record_worker): (Arc<dyn CompletionRecorder>, Option<JoinHandle<()>>) =
        match cfg.record_delivery {
            RecordDelivery::Direct => (Arc::new(records.clone()), None),
            RecordDelivery::Queued => {
                let (queued, worker) = QueuedCompletionRecorder::spawn(
                    Arc::new(records.clone()),
                    RECORD_QUEUE_CAPACITY,
                    telemetry.clone(),
                );
                (Arc::new(queued), Some(worker))
            }
        };

    let pipeline = Arc::new(
        ReplicationPipeline::new(
            source.container(&cfg.source_container),
            target.container(&cfg.target_container),
            orchestrator,
            recorder,
            telemetry,
        )
        .with_policy(cfg.failure_policy),
    );

    // --- One-shot run ---
    if let Mode::Trigger(name) = mode {
        let report = pipeline.run(&BlobEvent::new(name, Bytes::new())).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        drop(pipeline);
        flush_records(record_worker).await;
        if !report.is_success() {
            anyhow::bail!("replication run finished with failures");
        }
        return Ok(());
    }

    // --- Build router ---
    let state = AppState {
        pipeline,
        records,
        db,
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    flush_records(record_worker).await;
    Ok(())
}

/// Wait for queued completion records to be written.
async fn flush_records(worker: Option<JoinHandle<()>>) {
    if let Some(worker) = worker {
        if let Err(err) = worker.await {
            tracing::error!("completion record writer panicked: {}", err);
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// `https://{account}.blob.core.windows.net/` -> `{account}`.
fn account_from_uri(uri: &str) -> Result<String> {
    let url = Url::parse(uri).with_context(|| format!("parsing account uri `{uri}`"))?;
    url.host_str()
        .and_then(|host| host.split('.').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .with_context(|| format!("no account name in `{uri}`"))
}
