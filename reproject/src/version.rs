use chrono::{DateTime, Utc};
use reproject_store::Store;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{
    engine::{Change, ViewStore},
    error::{MigrationError, Result},
};

/// Identifier of a deployed set of projectors and table definitions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(pub u32);

impl Version {
    /// Version of a view schema no migration ever completed on.
    pub const ZERO: Version = Version(0);

    pub fn saturating_sub(self, versions: u32) -> Version {
        Version(self.0.saturating_sub(versions))
    }
}

impl From<u32> for Version {
    fn from(value: u32) -> Self {
        Version(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phase of a version ledger entry. A version without entry has not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    OnlineRunning,
    OnlineFinished,
    OfflineRunning,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::OnlineRunning => "online_running",
            Phase::OnlineFinished => "online_finished",
            Phase::OfflineRunning => "offline_running",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online_running" => Ok(Phase::OnlineRunning),
            "online_finished" => Ok(Phase::OnlineFinished),
            "offline_running" => Ok(Phase::OfflineRunning),
            "done" => Ok(Phase::Done),
            _ => Err(anyhow::anyhow!("unknown migration phase `{s}`").into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: Version,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub snapshot_marker: Option<i64>,
}

impl VersionEntry {
    pub fn new(version: Version, phase: Phase) -> Self {
        Self {
            version,
            phase,
            started_at: Utc::now(),
            ended_at: None,
            snapshot_marker: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

/// Durable record of migration phases.
///
/// At most one entry is not [`Phase::Done`] at any time. Claiming a new
/// version is atomic in every engine, a second claim while one is in flight
/// fails with [`MigrationError::ConcurrentMigration`].
#[derive(Clone)]
pub struct VersionLedger {
    views: ViewStore,
    store: Store,
}

impl VersionLedger {
    pub fn new(views: ViewStore, store: Store) -> Self {
        Self { views, store }
    }

    pub async fn entries(&self) -> Result<Vec<VersionEntry>> {
        let mut entries = self.views.versions().await?;
        entries.sort_by_key(|entry| entry.version);

        Ok(entries)
    }

    pub async fn current_version(&self) -> Result<Version> {
        Ok(self
            .latest_done()
            .await?
            .map(|entry| entry.version)
            .unwrap_or(Version::ZERO))
    }

    pub async fn latest(&self) -> Result<Option<VersionEntry>> {
        Ok(self.entries().await?.pop())
    }

    pub async fn latest_done(&self) -> Result<Option<VersionEntry>> {
        Ok(self.entries().await?.into_iter().rev().find(|e| e.is_done()))
    }

    pub async fn running(&self) -> Result<Vec<VersionEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| !e.is_done())
            .collect())
    }

    pub async fn version_currently_migrating(&self) -> Result<Option<Version>> {
        Ok(self.running().await?.first().map(|e| e.version))
    }

    pub async fn start_online(&self, version: Version) -> Result<()> {
        let entries = self.entries().await?;

        if let Some(running) = entries.iter().find(|e| !e.is_done()) {
            return Err(MigrationError::ConcurrentMigration(format!(
                "version {} is {}",
                running.version, running.phase
            )));
        }

        if let Some(entry) = entries.iter().find(|e| e.version == version) {
            return Err(MigrationError::MigrationAlreadyDone(entry.version));
        }

        if let Some(entry) = entries.iter().find(|e| e.version > version) {
            return Err(MigrationError::InvalidMigrationDefinition(format!(
                "version {version} is lower than migrated version {}",
                entry.version
            )));
        }

        let mut entry = VersionEntry::new(version, Phase::OnlineRunning);
        entry.snapshot_marker = Some(self.store.snapshot_marker().await?);

        if !self.views.claim_version(&entry).await? {
            return Err(MigrationError::ConcurrentMigration(format!(
                "version {version} claimed by another migration"
            )));
        }

        tracing::debug!("version {version} is {}", Phase::OnlineRunning);

        Ok(())
    }

    pub async fn end_online(&self, version: Version) -> Result<()> {
        self.transition(version, Phase::OnlineRunning, Phase::OnlineFinished)
            .await
            .map_err(|e| match e {
                MigrationError::UnexpectedPhase { version, expected } => {
                    MigrationError::InvalidMigrationDefinition(format!(
                        "version {version} is not {expected}"
                    ))
                }
                e => e,
            })
    }

    pub async fn start_offline(&self, version: Version) -> Result<()> {
        let entry = self
            .entries()
            .await?
            .into_iter()
            .find(|e| e.version == version)
            .ok_or(MigrationError::MigrationNotStarted(version))?;

        match entry.phase {
            Phase::Done => return Err(MigrationError::MigrationAlreadyDone(version)),
            Phase::OnlineFinished => {}
            phase => {
                return Err(MigrationError::ConcurrentMigration(format!(
                    "version {version} is {phase}"
                )))
            }
        }

        self.transition(version, Phase::OnlineFinished, Phase::OfflineRunning)
            .await
            .map_err(|e| match e {
                MigrationError::UnexpectedPhase { version, .. } => {
                    MigrationError::ConcurrentMigration(format!(
                        "version {version} changed while starting offline"
                    ))
                }
                e => e,
            })
    }

    pub async fn end_offline(&self, version: Version) -> Result<()> {
        self.views
            .execute(vec![Self::end_offline_change(version)])
            .await
            .map_err(|e| match e {
                MigrationError::UnexpectedPhase { version, expected } => {
                    MigrationError::InvalidMigrationDefinition(format!(
                        "version {version} is not {expected}"
                    ))
                }
                e => e,
            })
    }

    /// Staged form of [`VersionLedger::end_offline`], committed together with
    /// the table swap.
    pub fn end_offline_change(version: Version) -> Change {
        Change::Phase {
            version,
            from: Phase::OfflineRunning,
            to: Phase::Done,
        }
    }

    /// Deletes the unfinished entry of `version`. Done entries are kept.
    pub async fn rollback(&self, version: Version) -> Result<()> {
        self.views.delete_version(version).await
    }

    /// Records `version` as done without running a migration.
    pub async fn create_done(&self, version: Version) -> Result<()> {
        let mut entry = VersionEntry::new(version, Phase::Done);
        entry.ended_at = Some(entry.started_at);

        if !self.views.claim_version(&entry).await? {
            return Err(MigrationError::ConcurrentMigration(format!(
                "version {version} already recorded"
            )));
        }

        Ok(())
    }

    async fn transition(&self, version: Version, from: Phase, to: Phase) -> Result<()> {
        self.views
            .execute(vec![Change::Phase { version, from, to }])
            .await?;

        tracing::debug!("version {version} is {to}");

        Ok(())
    }
}
