use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pitr_vault::artifact::{ArtifactName, Catalog, RecoveryTarget};
use pitr_vault::backup::BackupOrchestrator;
use pitr_vault::config::{StoreConfig, VaultConfig};
use pitr_vault::crypto::{load_decryptor, load_encryptor, Decryptor, Encryptor, KeyPair};
use pitr_vault::monitor::{metrics, sink_for, AlertKind, Monitor};
use pitr_vault::restore::{CancelFlag, RestoreEngine, RestoreRequest};
use pitr_vault::retention::RetentionManager;
use pitr_vault::store::{FileObjectStore, MemoryObjectStore, ObjectStore, RemoteStore};
use pitr_vault::verify::{TestRestore, Verifier};
use pitr_vault::{db, ErrorCode, VaultError};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pitr-vault", version, about = "Encrypted backups, verification and point-in-time recovery")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "PITR_VAULT_CONFIG", default_value = "pitr-vault.json")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum TestRestoreArg {
    Auto,
    Always,
    Never,
}

impl From<TestRestoreArg> for TestRestore {
    fn from(arg: TestRestoreArg) -> Self {
        match arg {
            TestRestoreArg::Auto => TestRestore::Auto,
            TestRestoreArg::Always => TestRestore::Always,
            TestRestoreArg::Never => TestRestore::Never,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Take, encrypt and upload a full backup.
    Backup { environment: String },

    /// Ship completed WAL segments to the store.
    ArchiveWal { environment: String },

    /// Restore an artifact (or an environment's newest) into an isolated target.
    Restore {
        /// Artifact name, or an environment name for its newest artifact.
        artifact: String,
        /// RFC 3339 timestamp, `YYYY-MM-DD HH:MM:SS` (UTC) or `xid:<n>`.
        #[arg(long)]
        recovery_target: Option<String>,
        /// Environment name for the restore target.
        #[arg(long, default_value = "restore")]
        target_env: String,
    },

    /// Verify an artifact, or the newest artifact of every environment.
    Verify {
        artifact: Option<String>,
        #[arg(long, value_enum, default_value = "auto")]
        test_restore: TestRestoreArg,
    },

    /// Check freshness, size and store reachability; route alerts.
    Monitor { environment: String },

    /// Apply the retention policy.
    Prune { environment: String },

    /// List discoverable artifacts.
    List { environment: String },

    /// Generate an X25519 key pair (`backup.pub`, `backup.key`).
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Backup { .. } => "backup",
            Command::ArchiveWal { .. } => "archive-wal",
            Command::Restore { .. } => "restore",
            Command::Verify { .. } => "verify",
            Command::Monitor { .. } => "monitor",
            Command::Prune { .. } => "prune",
            Command::List { .. } => "list",
            Command::Keygen { .. } => "keygen",
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &VaultConfig) -> pitr_vault::Result<RemoteStore> {
    let backend: Arc<dyn ObjectStore> = match &config.store {
        StoreConfig::Memory => {
            warn!("Using the in-memory store; nothing outlives this process");
            Arc::new(MemoryObjectStore::new())
        }
        StoreConfig::Filesystem { root } => Arc::new(FileObjectStore::new(root.clone())),
        #[cfg(feature = "s3")]
        StoreConfig::S3(settings) => Arc::new(pitr_vault::store::S3ObjectStore::new(settings.clone(), config.retry.clone()).await?),
        #[cfg(not(feature = "s3"))]
        StoreConfig::S3(_) => {
            return Err(VaultError::Configuration(
                "built without the s3 feature".to_string(),
            ))
        }
    };
    Ok(RemoteStore::new(backend, config.retry.clone())
        .with_server_side_encryption(config.server_side_encryption.clone()))
}

fn encryptor(config: &VaultConfig) -> pitr_vault::Result<Encryptor> {
    let path = config
        .keys
        .public_key_path
        .as_deref()
        .ok_or_else(|| VaultError::Configuration("keys.public_key_path is not set".into()))?;
    load_encryptor(path)
}

fn decryptor(config: &VaultConfig) -> pitr_vault::Result<Decryptor> {
    let path = config
        .keys
        .private_key_path
        .as_deref()
        .ok_or_else(|| VaultError::Configuration("keys.private_key_path is required to decrypt".into()))?;
    load_decryptor(path)
}

fn load_config(path: &Path) -> anyhow::Result<VaultConfig> {
    VaultConfig::from_file(path)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("loading {}", path.display()))
}

async fn run(cli: Cli) -> anyhow::Result<Value> {
    if let Command::Keygen { out } = &cli.command {
        let (public, private) = KeyPair::generate().write_to(out)?;
        return Ok(json!({ "public_key": public, "private_key": private }));
    }

    let config = load_config(&cli.config)?;
    let store = open_store(&config).await?;
    let catalog = Catalog::new(store.clone());

    match cli.command {
        Command::Backup { environment } => {
            let database = db::connect(&config.environment(&environment)?.database);
            let orchestrator = BackupOrchestrator::new(config.clone(), store, encryptor(&config)?, database);
            let artifact = orchestrator.run_backup(&environment).await?;
            Ok(serde_json::to_value(artifact)?)
        }
        Command::ArchiveWal { environment } => {
            let database = db::connect(&config.environment(&environment)?.database);
            let orchestrator = BackupOrchestrator::new(config.clone(), store, encryptor(&config)?, database);
            Ok(serde_json::to_value(orchestrator.archive_wal(&environment).await?)?)
        }
        Command::Restore {
            artifact,
            recovery_target,
            target_env,
        } => {
            let recovery_target = recovery_target
                .as_deref()
                .map(str::parse::<RecoveryTarget>)
                .transpose()?;
            // The source environment's database knows how to build restore targets
            let source = artifact
                .parse::<ArtifactName>()
                .map(|name| name.environment)
                .unwrap_or_else(|_| artifact.clone());
            let database = db::connect(&config.environment(&source)?.database);
            let engine = RestoreEngine::new(config.clone(), catalog, decryptor(&config)?, database);

            let cancel = CancelFlag::new();
            let engine = engine.with_cancel_flag(cancel.clone());
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Cancellation requested; the restore target will be discarded");
                    cancel.cancel();
                }
            });

            let request = RestoreRequest {
                artifact,
                recovery_target,
                target_environment: target_env,
                discard_after: false,
            };
            Ok(serde_json::to_value(engine.restore(request).await?)?)
        }
        Command::Verify { artifact, test_restore } => {
            let decryptor = decryptor(&config)?;
            let sink = sink_for(&config);
            let targets: Vec<(String, Option<String>)> = match artifact {
                Some(name) => {
                    let record = catalog.get(&name).await?;
                    vec![(record.environment, Some(name))]
                }
                None => config.environments.keys().map(|env| (env.clone(), None)).collect(),
            };

            let mut records = Vec::new();
            let mut first_error: Option<VaultError> = None;
            for (environment, name) in targets {
                let database = db::connect(&config.environment(&environment)?.database);
                let verifier = Verifier::new(config.clone(), catalog.clone(), decryptor.clone(), database, sink.clone());
                let outcome = match &name {
                    Some(name) => verifier.verify(name, test_restore.into()).await,
                    None => verifier.verify_latest(&environment, test_restore.into()).await,
                };
                match outcome {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(environment = %environment, error = %e, "Verification failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            write_metrics(&config).await;
            match first_error {
                Some(e) => Err(e.into()),
                None => Ok(serde_json::to_value(records)?),
            }
        }
        Command::Monitor { environment } => {
            let monitor = Monitor::new(config.clone(), catalog, sink_for(&config));
            let alerts = monitor.check_health(&environment).await?;
            write_metrics(&config).await;
            if let Some(alert) = alerts.iter().find(|a| a.kind == AlertKind::StoreUnreachable) {
                return Err(VaultError::UpstreamUnreachable(alert.message.clone()).into());
            }
            info!(alerts = alerts.len(), "Health check finished");
            Ok(json!({ "environment": environment, "alerts": alerts }))
        }
        Command::Prune { environment } => {
            let report = RetentionManager::new(config.clone(), catalog).prune(&environment).await?;
            Ok(serde_json::to_value(report)?)
        }
        Command::List { environment } => Ok(serde_json::to_value(catalog.discoverable(&environment).await?)?),
        Command::Keygen { .. } => Ok(Value::Null),
    }
}

async fn write_metrics(config: &VaultConfig) {
    if let Some(path) = &config.metrics_textfile {
        if let Err(e) = metrics::write_textfile(path).await {
            warn!(path = %path.display(), error = %e, "Could not write metrics textfile");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let command = cli.command.name();

    match run(cli).await {
        Ok(result) => {
            println!("{}", json!({ "command": command, "status": "ok", "result": result }));
            ExitCode::SUCCESS
        }
        Err(err) => {
            let code = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<VaultError>())
                .map(VaultError::code)
                .unwrap_or(ErrorCode::InternalError);
            println!(
                "{}",
                json!({ "command": command, "status": "error", "code": code, "error": format!("{:#}", err) })
            );
            ExitCode::from(u8::try_from(code.exit_status()).unwrap_or(1))
        }
    }
}
