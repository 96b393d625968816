//! Snapshot-and-swap storage for summary tables.
//!
//! Layout under the store root:
//!
//! ```text
//! CURRENT                         run id of the published snapshot
//! runs/<run_id>/manifest.json
//! runs/<run_id>/<table>.csv
//! runs/<run_id>/service_records/year=YYYY/month=MM.csv
//! ```
//!
//! A run is written into a staging directory and renamed into `runs/`
//! ([`FsSnapshotStore::stage`]). It becomes visible only when
//! [`StagedRun::commit`] renames a fresh pointer file over `CURRENT`, so other
//! sinks can be written in between and a failure there leaves readers on the
//! previous run. Readers resolve `CURRENT` once and read an immutable run
//! directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{EnrichedRecord, Partition, RunSummary, SummaryTables};

const CURRENT: &str = "CURRENT";
const MANIFEST: &str = "manifest.json";
pub const DEMOGRAPHIC_USAGE: &str = "demographic_usage";
pub const MONTHLY_TRENDS: &str = "monthly_trends";
pub const SERVICE_GAPS: &str = "service_gaps";
pub const COUNSELOR_WORKLOAD: &str = "counselor_workload";
pub const STUDENT_RETENTION: &str = "student_retention";
pub const TEMPORAL_DEMAND: &str = "temporal_demand";
pub const POPULATION_USAGE: &str = "population_usage";

/// One run's immutable output.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub summary: RunSummary,
    pub tables: SummaryTables,
}

pub fn table_bytes<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| PipelineError::Csv(err.into_error().into()))
}

fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("runs")).map_err(|err| PipelineError::snapshot(&root, err))?;
        Ok(Self { root })
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("runs").join(run_id.to_string())
    }

    fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| PipelineError::snapshot(parent, err))?;
        }
        fs::write(path, bytes).map_err(|err| PipelineError::snapshot(path, err))
    }

    fn write_run(
        &self,
        dir: &Path,
        snapshot: &Snapshot,
        records: &[EnrichedRecord],
    ) -> Result<()> {
        let tables = &snapshot.tables;
        let files = [
            (DEMOGRAPHIC_USAGE, table_bytes(&tables.demographic_usage)?),
            (MONTHLY_TRENDS, table_bytes(&tables.monthly_trends)?),
            (SERVICE_GAPS, table_bytes(&tables.service_gaps)?),
            (COUNSELOR_WORKLOAD, table_bytes(&tables.counselor_workload)?),
            (STUDENT_RETENTION, table_bytes(&tables.student_retention)?),
            (TEMPORAL_DEMAND, table_bytes(&tables.temporal_demand)?),
            (POPULATION_USAGE, table_bytes(&tables.population_usage)?),
        ];
        for (name, bytes) in files {
            Self::write_file(&dir.join(format!("{name}.csv")), &bytes)?;
        }

        let mut partitions: BTreeMap<Partition, Vec<&EnrichedRecord>> = BTreeMap::new();
        for record in records {
            partitions.entry(record.partition()).or_default().push(record);
        }
        for (partition, members) in partitions {
            let path = dir.join("service_records").join(format!("{partition}.csv"));
            Self::write_file(&path, &table_bytes(&members)?)?;
        }

        let manifest = serde_json::to_vec_pretty(&snapshot.summary)?;
        Self::write_file(&dir.join(MANIFEST), &manifest)
    }

    /// Writes the run under `runs/` without publishing it.
    ///
    /// On failure the staging directory is removed and `CURRENT` is untouched.
    pub fn stage(&self, snapshot: &Snapshot, records: &[EnrichedRecord]) -> Result<StagedRun<'_>> {
        let run_id = snapshot.summary.run_id;
        let staging = self.root.join(format!(".staging-{run_id}"));

        let target = self.run_dir(run_id);
        let staged = self.write_run(&staging, snapshot, records).and_then(|()| {
            fs::rename(&staging, &target).map_err(|err| PipelineError::snapshot(&target, err))
        });
        if let Err(err) = staged {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(error = %cleanup, path = %staging.display(), "failed to remove staging dir");
            }
            return Err(err);
        }

        debug!(%run_id, path = %target.display(), "snapshot staged");
        Ok(StagedRun {
            store: self,
            run_id,
            path: target,
        })
    }

    fn point_current_at(&self, run_id: Uuid) -> Result<()> {
        let pointer = self.root.join(format!("{CURRENT}.tmp"));
        fs::write(&pointer, run_id.to_string())
            .map_err(|err| PipelineError::snapshot(&pointer, err))?;
        fs::rename(&pointer, self.root.join(CURRENT))
            .map_err(|err| PipelineError::snapshot(&pointer, err))
    }

    pub fn current_run_id(&self) -> Result<Option<Uuid>> {
        let path = self.root.join(CURRENT);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PipelineError::snapshot(&path, err)),
        };
        let run_id = Uuid::parse_str(content.trim()).map_err(|err| {
            PipelineError::snapshot(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            )
        })?;
        Ok(Some(run_id))
    }

    pub fn load_current(&self) -> Result<Snapshot> {
        let run_id = self
            .current_run_id()?
            .ok_or_else(|| PipelineError::NoSnapshot(self.root.clone()))?;
        self.load_run(run_id)
    }

    pub fn load_run(&self, run_id: Uuid) -> Result<Snapshot> {
        let dir = self.run_dir(run_id);
        let manifest_path = dir.join(MANIFEST);
        let manifest = fs::read(&manifest_path)
            .map_err(|err| PipelineError::snapshot(&manifest_path, err))?;
        let summary: RunSummary = serde_json::from_slice(&manifest)?;

        let table = |name: &str| dir.join(format!("{name}.csv"));
        let tables = SummaryTables {
            demographic_usage: read_table(&table(DEMOGRAPHIC_USAGE))?,
            monthly_trends: read_table(&table(MONTHLY_TRENDS))?,
            service_gaps: read_table(&table(SERVICE_GAPS))?,
            counselor_workload: read_table(&table(COUNSELOR_WORKLOAD))?,
            student_retention: read_table(&table(STUDENT_RETENTION))?,
            temporal_demand: read_table(&table(TEMPORAL_DEMAND))?,
            population_usage: read_table(&table(POPULATION_USAGE))?,
        };
        debug!(%run_id, "snapshot loaded");
        Ok(Snapshot { summary, tables })
    }
}

/// A fully written run that readers cannot see yet.
#[derive(Debug)]
#[must_use = "a staged run stays invisible until it is committed"]
pub struct StagedRun<'a> {
    store: &'a FsSnapshotStore,
    run_id: Uuid,
    path: PathBuf,
}

impl StagedRun<'_> {
    /// Atomically points `CURRENT` at this run.
    pub fn commit(self) -> Result<PathBuf> {
        self.store.point_current_at(self.run_id)?;
        info!(run_id = %self.run_id, path = %self.path.display(), "snapshot published");
        Ok(self.path)
    }

    /// Deletes the run; `CURRENT` keeps pointing where it did.
    pub fn discard(self) -> Result<()> {
        fs::remove_dir_all(&self.path).map_err(|err| PipelineError::snapshot(&self.path, err))?;
        warn!(run_id = %self.run_id, "staged snapshot discarded");
        Ok(())
    }
}
