// PostgreSQL collaborator
//
// Base snapshots stream from `pg_basebackup -D - -Ft -X fetch`. WAL comes from the
// directory `archive_command` copies completed segments into. Restore targets are fresh
// data directories, each on its own isolated port, replayed through `restore_command` from a staging
// directory that only holds the segments selected for this restore.

use super::{BaseSnapshot, Database, RestoreTarget, LiveInstance};
use crate::artifact::{WalPosition, WalSegment};
use crate::config::PostgresSettings;
use crate::{Result, VaultError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::future::Future;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// 16 MiB, the default segment size
const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const SEGMENTS_PER_XLOGID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE;

pub struct PostgresDatabase {
    settings: PostgresSettings,
}

impl PostgresDatabase {
    pub fn new(settings: PostgresSettings) -> Self {
        Self { settings }
    }

    async fn pool(&self, url: &str) -> Result<PgPool> {
        connect(url, self.settings.connect_timeout_secs).await
    }
}

async fn connect(url: &str, timeout_secs: u64) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(timeout_secs))
        .connect(url)
        .await
        .map_err(|e| VaultError::UpstreamUnreachable(format!("{}: {}", redact(url), e)))
}

/// Connection URL without credentials.
fn redact(url: &str) -> String {
    match (url.split_once("://"), url.rsplit_once('@')) {
        (Some((scheme, _)), Some((_, host))) => format!("{}://{}", scheme, host),
        _ => url.to_string(),
    }
}

/// Attempts at `pg_ctl start`, each on a freshly reserved port.
const START_ATTEMPTS: usize = 3;

lazy_static! {
    /// Ports held by restore targets in this process
    static ref RESERVED_PORTS: Mutex<HashSet<u16>> = Mutex::new(HashSet::new());
}

/// A restore port held for the life of one target. Released on drop.
#[derive(Debug)]
struct PortReservation(u16);

impl PortReservation {
    /// First port in `base..base + span` that no other target holds and nothing listens on.
    fn acquire(base: u16, span: u16) -> Result<Self> {
        let mut reserved = RESERVED_PORTS.lock();
        let end = base.saturating_add(span.max(1));
        for port in base..end {
            if reserved.contains(&port) || TcpListener::bind(("127.0.0.1", port)).is_err() {
                continue;
            }
            reserved.insert(port);
            return Ok(Self(port));
        }
        Err(VaultError::Configuration(format!(
            "no free restore port in {}..{}",
            base, end
        )))
    }

    fn port(&self) -> u16 {
        self.0
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        RESERVED_PORTS.lock().remove(&self.0);
    }
}

/// Same database on a different host and port.
fn retarget(url: &str, port: u16) -> Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| VaultError::Configuration(format!("invalid database url: {}", redact(url))))?;
    let (credentials, host_and_path) = match rest.rsplit_once('@') {
        Some((creds, tail)) => (format!("{}@", creds), tail),
        None => (String::new(), rest),
    };
    let path = host_and_path
        .find('/')
        .map(|i| &host_and_path[i..])
        .unwrap_or("/postgres");
    Ok(format!("{}://{}127.0.0.1:{}{}", scheme, credentials, port, path))
}

/// Parse `TTTTTTTTXXXXXXXXYYYYYYYY` into a global segment number.
fn parse_segment_name(name: &str) -> Option<u64> {
    if name.len() != 24 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    Some(log * SEGMENTS_PER_XLOGID + seg)
}

async fn run(command: &mut Command, what: &str) -> Result<()> {
    let status = command
        .status()
        .await
        .map_err(|e| VaultError::Configuration(format!("cannot run {}: {}", what, e)))?;
    if !status.success() {
        return Err(VaultError::Io(std::io::Error::other(format!("{} exited with {}", what, status))));
    }
    Ok(())
}

#[async_trait]
impl Database for PostgresDatabase {
    fn identity(&self) -> String {
        redact(&self.settings.url)
    }

    async fn ping(&self) -> Result<()> {
        let pool = self.pool(&self.settings.url).await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| VaultError::UpstreamUnreachable(e.to_string()))?;
        pool.close().await;
        Ok(())
    }

    async fn base_snapshot(&self, label: &str) -> Result<BaseSnapshot> {
        let pool = self.pool(&self.settings.url).await?;
        let lsn: String = sqlx::query("SELECT pg_current_wal_lsn()::text")
            .fetch_one(&pool)
            .await
            .map_err(|e| VaultError::UpstreamUnreachable(e.to_string()))?
            .try_get(0)
            .map_err(|e| VaultError::UpstreamUnreachable(e.to_string()))?;
        pool.close().await;
        let wal_start: WalPosition = lsn.parse()?;

        let mut child = Command::new(&self.settings.pg_basebackup)
            .arg("-d")
            .arg(&self.settings.url)
            .args(["-D", "-", "-Ft", "-X", "fetch", "-c", "fast", "-l", label])
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VaultError::Configuration(format!("cannot run pg_basebackup: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VaultError::Io(std::io::Error::other("pg_basebackup stdout unavailable")))?;

        info!(label = %label, wal_start = %wal_start, "pg_basebackup started");
        Ok(BaseSnapshot {
            label: label.to_string(),
            source: self.identity(),
            wal_start,
            started_at: Utc::now(),
            reader: Box::pin(ChildReader::new(stdout, child)),
        })
    }

    async fn completed_wal_segments(&self, after: Option<u64>) -> Result<Vec<WalSegment>> {
        let mut entries = tokio::fs::read_dir(&self.settings.wal_archive_dir)
            .await
            .map_err(|e| {
                VaultError::UpstreamUnreachable(format!(
                    "{}: {}",
                    self.settings.wal_archive_dir.display(),
                    e
                ))
            })?;
        let mut segments = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(sequence) = parse_segment_name(&name) else {
                continue;
            };
            if after.is_some_and(|a| sequence <= a) {
                continue;
            }
            let meta = entry.metadata().await?;
            let last_commit: DateTime<Utc> = meta.modified()?.into();
            segments.push(WalSegment {
                sequence,
                file_name: name,
                start: WalPosition(sequence * WAL_SEGMENT_SIZE),
                end: WalPosition((sequence + 1) * WAL_SEGMENT_SIZE),
                last_commit,
                last_xid: None,
                size_bytes: meta.len(),
            });
        }
        segments.sort_by_key(|s| s.sequence);
        Ok(segments)
    }

    async fn read_wal_segment(&self, segment: &WalSegment) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.settings.wal_archive_dir.join(&segment.file_name)).await?)
    }

    async fn prepare_target(&self, target_environment: &str) -> Result<Box<dyn RestoreTarget>> {
        let root = self.settings.restore_root.join(format!(
            "{}-{}",
            target_environment,
            &Uuid::new_v4().simple().to_string()[..8]
        ));
        let data_dir = root.join("data");
        let wal_dir = root.join("wal_restore");
        tokio::fs::create_dir_all(&data_dir).await?;
        tokio::fs::create_dir_all(&wal_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&data_dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        // Fail on a malformed url before reserving anything
        retarget(&self.settings.url, self.settings.restore_port)?;
        let port = PortReservation::acquire(self.settings.restore_port, self.settings.restore_port_span)?;
        Ok(Box::new(PostgresTarget {
            root,
            data_dir,
            wal_dir,
            pg_ctl: self.settings.pg_ctl.clone(),
            url: self.settings.url.clone(),
            base_port: self.settings.restore_port,
            port_span: self.settings.restore_port_span,
            port,
            timeout_secs: self.settings.connect_timeout_secs,
            extractor: None,
            started: false,
        }))
    }
}

struct Extractor {
    child: Child,
    stdin: ChildStdin,
}

struct PostgresTarget {
    root: PathBuf,
    data_dir: PathBuf,
    wal_dir: PathBuf,
    pg_ctl: PathBuf,
    /// Production url; restored instances are reached on the same database at `port`
    url: String,
    base_port: u16,
    port_span: u16,
    port: PortReservation,
    timeout_secs: u64,
    extractor: Option<Extractor>,
    started: bool,
}

impl PostgresTarget {
    fn spawn_extractor(data_dir: &Path) -> Result<Extractor> {
        let mut child = Command::new("tar")
            .arg("-x")
            .arg("-C")
            .arg(data_dir)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VaultError::Configuration(format!("cannot run tar: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| VaultError::Io(std::io::Error::other("tar stdin unavailable")))?;
        Ok(Extractor { child, stdin })
    }

    async fn write_recovery_config(&self) -> Result<()> {
        tokio::fs::write(self.data_dir.join("recovery.signal"), b"").await?;
        self.append_config(&format!(
            "\n# pitr-vault restore\nlisten_addresses = '127.0.0.1'\narchive_mode = off\nrestore_command = 'cp \"{}/%f\" \"%p\"'\nrecovery_target_action = 'promote'\n",
            self.wal_dir.display()
        ))
        .await
    }

    /// The last `port` line wins, so a retry on another port simply appends.
    async fn write_port(&self) -> Result<()> {
        self.append_config(&format!("port = {}\n", self.port.port())).await
    }

    async fn append_config(&self, lines: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.data_dir.join("postgresql.auto.conf"))
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn pg_ctl_start(&self) -> Result<()> {
        let log = self.root.join("postgres.log");
        run(
            Command::new(&self.pg_ctl)
                .arg("-D")
                .arg(&self.data_dir)
                .arg("-l")
                .arg(&log)
                .args(["-w", "-t", "600", "start"]),
            "pg_ctl start",
        )
        .await
    }
}

#[async_trait]
impl RestoreTarget for PostgresTarget {
    fn location(&self) -> String {
        format!("{} (port {})", self.data_dir.display(), self.port.port())
    }

    async fn write_base(&mut self, chunk: &[u8]) -> Result<()> {
        if self.extractor.is_none() {
            self.extractor = Some(Self::spawn_extractor(&self.data_dir)?);
        }
        if let Some(extractor) = self.extractor.as_mut() {
            extractor.stdin.write_all(chunk).await?;
        }
        Ok(())
    }

    async fn finish_base(&mut self) -> Result<()> {
        let Some(Extractor { mut child, stdin }) = self.extractor.take() else {
            return Err(VaultError::Integrity("empty base snapshot".into()));
        };
        drop(stdin);
        let status = child.wait().await?;
        if !status.success() {
            return Err(VaultError::Integrity(format!("tar extraction failed: {}", status)));
        }
        Ok(())
    }

    async fn apply_wal(&mut self, segment: &WalSegment, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.wal_dir.join(&segment.file_name), data).await?;
        Ok(())
    }

    async fn start(&mut self) -> Result<Box<dyn LiveInstance>> {
        self.write_recovery_config().await?;
        let mut attempt = 1;
        loop {
            self.write_port().await?;
            match self.pg_ctl_start().await {
                Ok(()) => break,
                // Another process may have bound the port since it was reserved
                Err(e) if attempt < START_ATTEMPTS => {
                    warn!(port = self.port.port(), attempt, error = %e, "Restored instance did not start, trying another port");
                    let next = PortReservation::acquire(self.base_port, self.port_span)?;
                    self.port = next;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        self.started = true;
        info!(location = %self.location(), "Restored instance started");

        let url = retarget(&self.url, self.port.port())?;
        let pool = connect(&url, self.timeout_secs).await?;
        Ok(Box::new(PostgresLive { pool }))
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        if self.started {
            if let Err(e) = run(
                Command::new(&self.pg_ctl)
                    .arg("-D")
                    .arg(&self.data_dir)
                    .args(["-m", "immediate", "stop"]),
                "pg_ctl stop",
            )
            .await
            {
                warn!(location = %self.location(), error = %e, "Stopping restored instance failed");
            }
        }
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(location = %self.root.display(), "Restore target discarded");
        Ok(())
    }
}

struct PostgresLive {
    pool: PgPool,
}

#[async_trait]
impl LiveInstance for PostgresLive {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| VaultError::UpstreamUnreachable(e.to_string()))?;
        Ok(())
    }

    async fn table_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
             AND table_type = 'BASE TABLE'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| VaultError::SmokeTest(e.to_string()))?
        .try_get(0)
        .map_err(|e| VaultError::SmokeTest(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn relation_exists(&self, name: &str) -> Result<bool> {
        sqlx::query("SELECT to_regclass($1) IS NOT NULL")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VaultError::SmokeTest(e.to_string()))?
            .try_get(0)
            .map_err(|e| VaultError::SmokeTest(e.to_string()))
    }
}

/// Child stdout that reports a failed exit status as a read error at EOF.
struct ChildReader {
    stdout: ChildStdout,
    exit: Option<JoinHandle<std::io::Result<ExitStatus>>>,
}

impl ChildReader {
    fn new(stdout: ChildStdout, mut child: Child) -> Self {
        let exit = tokio::spawn(async move { child.wait().await });
        Self {
            stdout,
            exit: Some(exit),
        }
    }
}

impl AsyncRead for ChildReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.stdout).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => {}
            other => return other,
        }

        let Some(exit) = self.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let outcome = match Pin::new(exit).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        self.exit = None;
        match outcome {
            Ok(Ok(status)) if status.success() => Poll::Ready(Ok(())),
            Ok(Ok(status)) => Poll::Ready(Err(std::io::Error::other(format!(
                "snapshot process exited with {}",
                status
            )))),
            Ok(Err(e)) => Poll::Ready(Err(e)),
            Err(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
        }
    }
}
