//! Artifact naming convention.
//!
//! `{environment}/{kind}/{YYYYMMDD_HHMMSS}.archive.enc`, with an optional `_{n}` suffix after the
//! timestamp when two runs land in the same second. WAL segments live under
//! `{environment}/wal/{sequence:020}.wal.enc`.

use super::types::BackupKind;
use crate::{Result, VaultError};
use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const ARTIFACT_SUFFIX: &str = ".archive.enc";
const WAL_SUFFIX: &str = ".wal.enc";

lazy_static! {
    static ref ENVIRONMENT_RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$").unwrap();
    static ref ARTIFACT_RE: Regex = Regex::new(
        r"^(?P<env>[A-Za-z0-9][A-Za-z0-9_-]{0,62})/(?P<kind>[A-Z]+)/(?P<stamp>\d{8}_\d{6})(?:_(?P<n>[1-9]\d*))?\.archive\.enc$"
    )
    .unwrap();
    static ref WAL_RE: Regex =
        Regex::new(r"^(?P<env>[A-Za-z0-9][A-Za-z0-9_-]{0,62})/wal/(?P<seq>\d{20})\.wal\.enc$").unwrap();
}

/// Reject environment names that would escape their prefix.
pub fn validate_environment(environment: &str) -> Result<()> {
    if ENVIRONMENT_RE.is_match(environment) {
        Ok(())
    } else {
        Err(VaultError::Configuration(format!(
            "invalid environment name: {:?}",
            environment
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName {
    pub environment: String,
    pub kind: BackupKind,
    pub created: NaiveDateTime,
    pub suffix: Option<u32>,
}

impl ArtifactName {
    pub fn new(environment: &str, kind: BackupKind, created: DateTime<Utc>) -> Result<Self> {
        validate_environment(environment)?;
        let created = NaiveDateTime::parse_from_str(
            &created.format(STAMP_FORMAT).to_string(),
            STAMP_FORMAT,
        )
        .map_err(|e| VaultError::Configuration(format!("invalid creation time: {}", e)))?;
        Ok(Self {
            environment: environment.to_string(),
            kind,
            created,
            suffix: None,
        })
    }

    /// Next candidate when this name is already taken.
    pub fn disambiguated(&self) -> Self {
        Self {
            suffix: Some(self.suffix.map_or(1, |n| n + 1)),
            ..self.clone()
        }
    }

    pub fn stamp(&self) -> String {
        self.created.format(STAMP_FORMAT).to_string()
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.environment, self.kind, self.stamp())?;
        if let Some(n) = self.suffix {
            write!(f, "_{}", n)?;
        }
        f.write_str(ARTIFACT_SUFFIX)
    }
}

impl FromStr for ArtifactName {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = ARTIFACT_RE
            .captures(s)
            .ok_or_else(|| VaultError::NotFound(format!("not an artifact name: {}", s)))?;
        let kind: BackupKind = caps["kind"].parse()?;
        let created = NaiveDateTime::parse_from_str(&caps["stamp"], STAMP_FORMAT)
            .map_err(|_| VaultError::NotFound(format!("not an artifact name: {}", s)))?;
        let suffix = caps
            .name("n")
            .map(|m| m.as_str().parse::<u32>())
            .transpose()
            .map_err(|_| VaultError::NotFound(format!("not an artifact name: {}", s)))?;
        Ok(Self {
            environment: caps["env"].to_string(),
            kind,
            created,
            suffix,
        })
    }
}

impl Ord for ArtifactName {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.environment, self.kind, self.created, self.suffix.unwrap_or(0)).cmp(&(
            &other.environment,
            other.kind,
            other.created,
            other.suffix.unwrap_or(0),
        ))
    }
}

impl PartialOrd for ArtifactName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn artifact_prefix(environment: &str, kind: BackupKind) -> String {
    format!("{}/{}/", environment, kind)
}

pub fn wal_prefix(environment: &str) -> String {
    format!("{}/wal/", environment)
}

pub fn wal_object_name(environment: &str, sequence: u64) -> String {
    format!("{}{:020}{}", wal_prefix(environment), sequence, WAL_SUFFIX)
}

/// Sequence number of a WAL object name, if it is one.
pub fn parse_wal_object_name(name: &str) -> Option<(String, u64)> {
    let caps = WAL_RE.captures(name)?;
    let seq = caps["seq"].parse().ok()?;
    Some((caps["env"].to_string(), seq))
}
