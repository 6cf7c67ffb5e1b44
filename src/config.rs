use crate::{
    errors::ConfigError,
    services::{pipeline::FailurePolicy, recorder::RecordMode},
};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

/// How completion records reach the database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordDelivery {
    /// Insert inside the run.
    #[default]
    Direct,
    /// Enqueue and let a background writer insert.
    Queued,
}

impl FromStr for RecordDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "queued" => Ok(Self::Queued),
            other => Err(format!(
                "unknown record delivery `{other}`, expected `direct` or `queued`"
            )),
        }
    }
}

/// What the process should do after configuration is loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    /// Run the pipeline once for a synthetic event with this name.
    Trigger(String),
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; CLI wins.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub source_uri: String,
    pub target_uri: String,
    pub source_account: String,
    pub telemetry_key: String,
    pub database_url: String,
    pub source_container: String,
    pub target_container: String,
    pub failure_policy: FailurePolicy,
    pub record_mode: RecordMode,
    pub record_delivery: RecordDelivery,
    pub copy_poll: Duration,
    pub cache_delegation_key: bool,
    /// Service principal tenant. Used only together with `client_secret`.
    pub tenant_id: Option<String>,
    /// Service principal client, or user-assigned managed identity when no secret is set.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Fixed bearer token instead of the credential chain. Development only.
    pub access_token: Option<String>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("source_uri", &self.source_uri)
            .field("target_uri", &self.target_uri)
            .field("source_account", &self.source_account)
            .field("telemetry_key", &"[REDACTED]")
            .field("database_url", &self.database_url)
            .field("source_container", &self.source_container)
            .field("target_container", &self.target_container)
            .field("failure_policy", &self.failure_policy)
            .field("record_mode", &self.record_mode)
            .field("record_delivery", &self.record_delivery)
            .field("copy_poll", &self.copy_poll)
            .field("cache_delegation_key", &self.cache_delegation_key)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Replicates blobs between storage containers")]
pub struct Args {
    /// Host to bind to (overrides REPLICATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides REPLICATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Source blob service endpoint (overrides SOURCE_BLOB_STORAGE_URI)
    #[arg(long)]
    pub source_uri: Option<String>,

    /// Target blob service endpoint (overrides TARGET_BLOB_STORAGE_URI)
    #[arg(long)]
    pub target_uri: Option<String>,

    /// Source storage account name (overrides SOURCE_BLOB_STORAGE_ACCOUNT_NAME)
    #[arg(long)]
    pub source_account: Option<String>,

    /// Application Insights instrumentation key (overrides APP_INSIGHTS_KEY)
    #[arg(long)]
    pub telemetry_key: Option<String>,

    /// Database URL (overrides REPLICATOR_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run the pipeline once for an event with this blob name, print the report and exit
    #[arg(long, value_name = "NAME", conflicts_with = "migrate")]
    pub trigger: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode), ConfigError> {
        let args = Args::parse();
        let mode = match (&args.trigger, args.migrate) {
            (Some(name), _) => Mode::Trigger(name.clone()),
            (None, true) => Mode::Migrate,
            (None, false) => Mode::Serve,
        };
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, mode))
    }

    /// Merge `args` over values looked up through `env`.
    pub fn resolve(
        args: Args,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let lookup = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let required = |flag: Option<String>, key: &'static str| {
            flag.or_else(|| lookup(key))
                .ok_or(ConfigError::Missing { key })
        };

        let port = match args.port {
            Some(port) => port,
            None => parse_or(lookup("REPLICATOR_PORT"), "REPLICATOR_PORT", 7071)?,
        };
        let poll_ms: u64 = parse_or(lookup("REPLICATOR_COPY_POLL_MS"), "REPLICATOR_COPY_POLL_MS", 500)?;
        if poll_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "REPLICATOR_COPY_POLL_MS",
                value: "0".into(),
                reason: "poll interval must be positive".into(),
            });
        }

        Ok(Self {
            host: args
                .host
                .or_else(|| lookup("REPLICATOR_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port,
            source_uri: required(args.source_uri, "SOURCE_BLOB_STORAGE_URI")?,
            target_uri: required(args.target_uri, "TARGET_BLOB_STORAGE_URI")?,
            source_account: required(args.source_account, "SOURCE_BLOB_STORAGE_ACCOUNT_NAME")?,
            telemetry_key: required(args.telemetry_key, "APP_INSIGHTS_KEY")?,
            database_url: required(args.database_url, "REPLICATOR_DATABASE_URL")?,
            source_container: lookup("REPLICATOR_SOURCE_CONTAINER")
                .unwrap_or_else(|| "test".into()),
            target_container: lookup("REPLICATOR_TARGET_CONTAINER")
                .unwrap_or_else(|| "target".into()),
            failure_policy: parse_or(
                lookup("REPLICATOR_FAILURE_POLICY"),
                "REPLICATOR_FAILURE_POLICY",
                FailurePolicy::default(),
            )?,
            record_mode: parse_or(
                lookup("REPLICATOR_RECORD_MODE"),
                "REPLICATOR_RECORD_MODE",
                RecordMode::default(),
            )?,
            record_delivery: parse_or(
                lookup("REPLICATOR_RECORD_DELIVERY"),
                "REPLICATOR_RECORD_DELIVERY",
                RecordDelivery::default(),
            )?,
            copy_poll: Duration::from_millis(poll_ms),
            cache_delegation_key: parse_or(
                lookup("REPLICATOR_CACHE_DELEGATION_KEY"),
                "REPLICATOR_CACHE_DELEGATION_KEY",
                false,
            )?,
            tenant_id: lookup("AZURE_TENANT_ID"),
            client_id: lookup("AZURE_CLIENT_ID"),
            client_secret: lookup("AZURE_CLIENT_SECRET"),
            access_token: lookup("REPLICATOR_ACCESS_TOKEN"),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
            value,
        }),
    }
}
