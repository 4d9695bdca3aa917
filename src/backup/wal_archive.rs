// WAL archiving - ship completed segments, encrypted, to {env}/wal/
//
// Runs under its own `{env}.wal` lease so it can interleave with backup runs. Sequences
// already present in the store are skipped, which makes a pass safe to repeat.

use super::BackupOrchestrator;
use crate::artifact::catalog::{
    WAL_END, WAL_FILE_NAME, WAL_LAST_COMMIT, WAL_LAST_XID, WAL_RAW_SIZE, WAL_SEQUENCE, WAL_START,
};
use crate::artifact::{wal_object_name, WalSegment};
use crate::crypto::encrypt_bytes;
use crate::monitor::metrics::{self, Timer};
use crate::report::{Operation, RunReport};
use crate::store::{sha256_hex, ObjectMetadata, PutOutcome, PutSource, CHECKSUM_KEY};
use crate::Result;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalArchiveReport {
    pub environment: String,
    /// Sequences uploaded by this pass
    pub archived: Vec<u64>,
    /// Sequences that were already in the store
    pub skipped: usize,
    pub bytes: u64,
}

fn segment_metadata(environment: &str, segment: &WalSegment, sealed: &[u8]) -> ObjectMetadata {
    ObjectMetadata::new()
        .with("environment", environment)
        .with(WAL_SEQUENCE, segment.sequence.to_string())
        .with(WAL_FILE_NAME, &segment.file_name)
        .with(WAL_START, segment.start.to_string())
        .with(WAL_END, segment.end.to_string())
        .with(
            WAL_LAST_COMMIT,
            segment.last_commit.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        )
        .with(
            WAL_LAST_XID,
            segment.last_xid.map(|x| x.to_string()).unwrap_or_default(),
        )
        .with(WAL_RAW_SIZE, segment.size_bytes.to_string())
        .with(CHECKSUM_KEY, sha256_hex(sealed))
}

impl BackupOrchestrator {
    /// Archive every completed WAL segment not yet in the store.
    #[instrument(skip(self), fields(environment = %environment))]
    pub async fn archive_wal(&self, environment: &str) -> Result<WalArchiveReport> {
        self.config.environment(environment)?;
        let timer = Timer::start();
        let scope = format!("{}.wal", environment);
        let mut lease = self.lock.acquire(&scope, &self.owner).await?;

        let outcome = self.holding(&mut lease, self.ship_segments(environment)).await;

        if let Err(e) = lease.release().await {
            warn!(error = %e, "Releasing WAL lease failed; it will expire");
        }

        let mut run = RunReport::new(Operation::ArchiveWal, environment, self.clock.now());
        run.source = Some(self.database.identity());
        run.duration_ms = timer.elapsed_ms();
        match &outcome {
            Ok(report) => {
                run.size_bytes = report.bytes;
                metrics::record_wal_archived(environment, report.archived.len());
                info!(archived = report.archived.len(), skipped = report.skipped, "WAL archiving finished");
            }
            Err(e) => run.fail(e),
        }
        // Routine passes that ship nothing are not worth an audit record
        if outcome.as_ref().map_or(true, |r| !r.archived.is_empty()) {
            if let Err(e) = run.save(self.catalog.store()).await {
                warn!(error = %e, "Could not persist WAL archiving report");
            }
        }
        outcome
    }

    async fn ship_segments(&self, environment: &str) -> Result<WalArchiveReport> {
        let present: HashSet<u64> = self
            .catalog
            .wal_segments(environment)
            .await?
            .into_iter()
            .map(|(_, s)| s.sequence)
            .collect();

        let mut report = WalArchiveReport {
            environment: environment.to_string(),
            ..WalArchiveReport::default()
        };

        for segment in self.database.completed_wal_segments(None).await? {
            if present.contains(&segment.sequence) {
                report.skipped += 1;
                continue;
            }
            let data = self.database.read_wal_segment(&segment).await?;
            let sealed = encrypt_bytes(&self.encryptor, &data).await?;
            let metadata = segment_metadata(environment, &segment, &sealed);
            let name = wal_object_name(environment, segment.sequence);

            match self
                .catalog
                .store()
                .put(&name, PutSource::Bytes(Bytes::from(sealed)), &metadata)
                .await?
            {
                PutOutcome::Stored { bytes } => {
                    report.bytes += bytes;
                    report.archived.push(segment.sequence);
                    info!(
                        sequence = segment.sequence,
                        file = %segment.file_name,
                        last_commit = %segment.last_commit,
                        "WAL segment archived"
                    );
                }
                PutOutcome::AlreadyPresent => report.skipped += 1,
            }
        }
        Ok(report)
    }
}
