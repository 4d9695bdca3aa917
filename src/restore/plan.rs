// WAL replay planning
//
// Replay is segment-granular: a segment is applied whole or not at all. The plan applies
// every contiguous segment after the base whose last commit is at or before the target,
// and requires proof that the archive covers the target: a later segment whose last
// commit reaches it. Without that proof the restore fails instead of quietly returning an
// older state.

use crate::artifact::{RecoveryTarget, WalPosition, WalSegment};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};

/// Segments to replay, in order, with their object names.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPlan {
    pub segments: Vec<(String, WalSegment)>,
    /// Last commit time the restored state includes
    pub recovered_through: DateTime<Utc>,
}

fn covers(segment: &WalSegment, target: &RecoveryTarget) -> Result<(bool, bool)> {
    match target {
        RecoveryTarget::Time(at) => Ok((segment.last_commit <= *at, segment.last_commit >= *at)),
        RecoveryTarget::Transaction(xid) => match segment.last_xid {
            Some(last) => Ok((last <= *xid, last >= *xid)),
            None => Err(VaultError::InsufficientWal(format!(
                "segment {} carries no transaction ids; use a time target",
                segment.file_name
            ))),
        },
    }
}

/// Choose the segments that bring a base snapshot forward to `target`.
///
/// `segments` may be unordered and may include segments older than the base.
pub fn plan_wal_replay(
    wal_start: WalPosition,
    snapshot_at: DateTime<Utc>,
    target: &RecoveryTarget,
    segments: &[(String, WalSegment)],
) -> Result<ReplayPlan> {
    if let RecoveryTarget::Time(at) = target {
        if *at < snapshot_at {
            return Err(VaultError::InsufficientWal(format!(
                "target {} precedes the base snapshot taken at {}",
                at.to_rfc3339(),
                snapshot_at.to_rfc3339()
            )));
        }
    }

    let mut candidates: Vec<&(String, WalSegment)> =
        segments.iter().filter(|(_, s)| s.end > wal_start).collect();
    candidates.sort_by_key(|(_, s)| s.sequence);

    let mut plan = Vec::new();
    let mut expected_start = wal_start;
    let mut recovered_through = snapshot_at;
    let mut reached = false;

    for (index, (name, segment)) in candidates.into_iter().enumerate() {
        let contiguous = if index == 0 {
            segment.start <= wal_start
        } else {
            segment.start == expected_start
        };
        if !contiguous {
            return Err(VaultError::InsufficientWal(format!(
                "WAL gap before segment {} (expected start {}, found {})",
                segment.file_name, expected_start, segment.start
            )));
        }
        expected_start = segment.end;

        let (include, reaches) = covers(segment, target)?;
        if include {
            recovered_through = recovered_through.max(segment.last_commit);
            plan.push((name.clone(), segment.clone()));
        }
        if reaches {
            reached = true;
            break;
        }
    }

    if !reached {
        return Err(VaultError::InsufficientWal(format!(
            "archived WAL ends before target {}",
            target
        )));
    }

    Ok(ReplayPlan {
        segments: plan,
        recovered_through,
    })
}
