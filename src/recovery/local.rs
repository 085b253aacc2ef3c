//! Local recovery: rebuilding a node's own ranges at startup
//!
//! # Sequence (strict order)
//!
//! 1. Read every entity from the metalog
//! 2. Strip PHANTOM range entities; they were never adopted
//! 3. Install the metalog handle and the RemoveOkLogs entity
//! 4. For root, metadata, system, user in turn:
//!    load the class's ranges into a scratch table, replay the class
//!    commit log into it, enqueue finishing tasks for interrupted splits
//!    and relinquishes, merge into the live table, create the class log
//!    for future appends, open the class gate
//! 5. Record a RemoveOkLogs entity if none existed
//!
//! A metalog failure is fatal. A corrupt commit-log fragment is fatal
//! unless the node is configured to skip corrupt fragments.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::commitlog::CommitLogReader;
use crate::crash_point::{maybe_crash, points};
use crate::metalog::{Entity, FileMetaLog, MetaLogStore, RangeEntity, RemoveOkLogsEntity};
use crate::observability::{Event, Logger, ObservationScope, Timer};
use crate::range::{
    verify_partition, LiveRangeTable, MaintenanceTask, PartitionIssue, Range, TableClass,
};

use super::context::NodeContext;
use super::errors::{RecoveryError, RecoveryResult};
use super::replay::replay_log;

/// Outcome of replaying one class.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassReport {
    pub class: Option<TableClass>,
    pub ranges_loaded: usize,
    pub tables_skipped: Vec<String>,
    pub blocks_replayed: u64,
    pub pairs_applied: u64,
    pub pairs_skipped: u64,
    pub skipped_fragments: Vec<u32>,
    pub commit_log_created: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub location: String,
    pub phantoms_stripped: usize,
    pub classes: Vec<ClassReport>,
    pub maintenance_tasks: Vec<String>,
    pub linked_logs: BTreeSet<PathBuf>,
    pub remove_ok_logs_created: bool,
    pub open_order: Vec<TableClass>,
    /// Ranges of this node that overlap each other
    pub overlaps: Vec<String>,
    pub duration_ms: String,
}

pub struct LocalRecoveryCoordinator {
    ctx: Arc<NodeContext>,
}

impl LocalRecoveryCoordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Opens the node's file metalog and recovers from it.
    pub fn recover(&self) -> RecoveryResult<RecoveryReport> {
        let metalog = FileMetaLog::open(&self.ctx.config.log_dir(), self.ctx.config.metalog_max_files)
            .map_err(|e| {
                if e.is_fatal() {
                    Logger::event(
                        Event::MetalogCorruption,
                        &[("location", &self.ctx.config.location), ("error", &e.to_string())],
                    );
                }
                RecoveryError::from(e)
            })?;
        self.recover_with(Arc::new(metalog))
    }

    /// Like [`recover`](Self::recover), aborting the process on failure.
    pub fn recover_or_abort(&self) -> RecoveryReport {
        match self.recover() {
            Ok(report) => report,
            Err(e) => {
                Logger::event(
                    Event::RecoveryFailed,
                    &[
                        ("code", e.code()),
                        ("error", &e.to_string()),
                        ("location", &self.ctx.config.location),
                    ],
                );
                std::process::abort();
            }
        }
    }

    /// Recovers from an already opened metalog.
    pub fn recover_with(&self, metalog: Arc<dyn MetaLogStore>) -> RecoveryResult<RecoveryReport> {
        let timer = Timer::new();
        let location = self.ctx.config.location.clone();
        Logger::event(Event::RecoveryStart, &[("location", &location)]);

        let mut ranges = Vec::new();
        let mut remove_ok: Option<RemoveOkLogsEntity> = None;
        for entity in metalog.get_entities()? {
            match entity {
                Entity::Range(range) => ranges.push(range),
                Entity::RemoveOkLogs(logs) => {
                    if remove_ok.as_ref().map_or(true, |kept| logs.timestamp >= kept.timestamp) {
                        remove_ok = Some(logs);
                    }
                }
            }
        }

        let (ranges, phantoms_stripped) = self.strip_phantoms(metalog.as_ref(), ranges)?;

        if let Some(entity) = remove_ok {
            self.ctx.set_remove_ok_logs(entity);
        }
        self.ctx.install_metalog(metalog.clone());

        let mut by_class: BTreeMap<TableClass, Vec<RangeEntity>> = BTreeMap::new();
        for range in ranges {
            by_class.entry(range.spec.class()).or_default().push(range);
        }

        let mut report = RecoveryReport {
            location: location.clone(),
            phantoms_stripped,
            ..RecoveryReport::default()
        };
        let mut replayed = [false; 4];

        for class in TableClass::ALL {
            let scope = ObservationScope::with_fields(
                "CLASS_REPLAY",
                &[("class", class.as_str()), ("location", &location)],
            );
            let entities = by_class.remove(&class).unwrap_or_default();
            match self.recover_class(class, entities, metalog.as_ref(), &mut replayed) {
                Ok((class_report, linked)) => {
                    scope.complete_with_fields(&[
                        ("pairs_applied", &class_report.pairs_applied.to_string()),
                        ("ranges", &class_report.ranges_loaded.to_string()),
                    ]);
                    report.linked_logs.extend(linked);
                    report.classes.push(class_report);
                }
                Err(e) => {
                    if e.is_fatal() {
                        scope.fail_fatal(&e.to_string());
                    } else {
                        scope.fail(&e.to_string());
                    }
                    return Err(e);
                }
            }
        }

        if self.ctx.remove_ok_logs().is_none() {
            maybe_crash(points::RECOVERY_BEFORE_REMOVE_OK_LOGS);
            let entity = RemoveOkLogsEntity::new(metalog.next_entity_id(), report.linked_logs.clone());
            metalog.record_state(&[Entity::RemoveOkLogs(entity.clone())])?;
            self.ctx.set_remove_ok_logs(entity);
            report.remove_ok_logs_created = true;
        }

        for issue in verify_partition(self.ctx.live_map.specs()) {
            if let PartitionIssue::Overlap { .. } = issue {
                Logger::event_owned(
                    Event::PartitionIssue,
                    &[("issue", issue.to_string()), ("location", location.clone())],
                );
                report.overlaps.push(issue.to_string());
            }
        }

        report.maintenance_tasks = self
            .ctx
            .maintenance
            .pending()
            .iter()
            .map(MaintenanceTask::to_string)
            .collect();
        report.open_order = self.ctx.barrier.open_order();
        report.duration_ms = timer.elapsed_ms();

        Logger::event_owned(
            Event::RecoveryComplete,
            &[
                ("duration_ms", report.duration_ms.clone()),
                ("location", location),
                ("ranges", self.ctx.live_map.range_count().to_string()),
            ],
        );
        Ok(report)
    }

    /// Removes never-adopted phantom entities and their staging directories.
    fn strip_phantoms(
        &self,
        metalog: &dyn MetaLogStore,
        ranges: Vec<RangeEntity>,
    ) -> RecoveryResult<(Vec<RangeEntity>, usize)> {
        let (phantoms, kept): (Vec<_>, Vec<_>) =
            ranges.into_iter().partition(|r| r.state.is_phantom());

        for phantom in &phantoms {
            if phantom.state.has_phantom_transfer_log() {
                if let Some(dir) = &phantom.state.transfer_log {
                    match fs::remove_dir_all(dir) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => Logger::warn(
                            "PHANTOM_LOG_REMOVE_FAILED",
                            &[("dir", &dir.display().to_string()), ("error", &e.to_string())],
                        ),
                    }
                }
            }
            metalog.record_removal(&Entity::Range(phantom.clone()))?;
            self.ctx.metrics.increment_phantom_entities_stripped();
            Logger::event(
                Event::PhantomEntityStripped,
                &[
                    ("location", &self.ctx.config.location),
                    ("range", &phantom.spec.name()),
                ],
            );
        }
        if !phantoms.is_empty() {
            maybe_crash(points::RECOVERY_AFTER_PHANTOM_STRIP);
        }
        Ok((kept, phantoms.len()))
    }

    fn recover_class(
        &self,
        class: TableClass,
        entities: Vec<RangeEntity>,
        metalog: &dyn MetaLogStore,
        replayed: &mut [bool; 4],
    ) -> RecoveryResult<(ClassReport, BTreeSet<PathBuf>)> {
        let mut report = ClassReport {
            class: Some(class),
            ..ClassReport::default()
        };
        let scratch = LiveRangeTable::new();
        let mut upgraded = Vec::new();

        for mut entity in entities {
            let table_id = entity.spec.table.id.clone();
            let generation = match self.ctx.catalog.generation(&table_id) {
                Some(generation) => generation,
                None if class == TableClass::User => {
                    Logger::event(
                        Event::TableSkipped,
                        &[("range", &entity.spec.name()), ("table", &table_id)],
                    );
                    report.tables_skipped.push(table_id);
                    continue;
                }
                None => return Err(RecoveryError::TableNotFound { table: table_id }),
            };
            if generation > entity.spec.table.generation {
                Logger::event_owned(
                    Event::TableGenerationUpgraded,
                    &[
                        ("from", entity.spec.table.generation.to_string()),
                        ("table", table_id.clone()),
                        ("to", generation.to_string()),
                    ],
                );
                entity.spec.table.generation = generation;
                entity.touch();
                upgraded.push(Entity::Range(entity.clone()));
            }

            if let Some(task) = MaintenanceTask::for_state(entity.state.kind, &entity.spec) {
                Logger::event(
                    Event::MaintenanceScheduled,
                    &[("task", &task.to_string())],
                );
                self.ctx.maintenance.add(task);
                self.ctx.metrics.increment_maintenance_tasks_scheduled();
            }
            scratch.add_range(Arc::new(Range::new(entity)));
        }
        metalog.record_state(&upgraded)?;

        let mut linked = BTreeSet::new();
        if !scratch.is_empty() {
            let mut reader = CommitLogReader::open(
                &self.ctx.class_log_dir(class),
                self.ctx.config.skip_corrupt_fragments,
            )?;
            let stats = replay_log(&mut reader, &scratch, &self.ctx.metrics).map_err(|e| {
                if let RecoveryError::CorruptFragment { fragment_id, .. } = &e {
                    Logger::event_owned(
                        Event::CommitLogCorruption,
                        &[
                            ("class", class.as_str().to_string()),
                            ("fragment", fragment_id.to_string()),
                        ],
                    );
                }
                e
            })?;
            report.blocks_replayed = stats.blocks_replayed;
            report.pairs_applied = stats.pairs_applied;
            report.pairs_skipped = stats.pairs_skipped;
            report.skipped_fragments = stats.skipped_fragments;
            linked = stats.linked_logs;
            replayed[class.index()] = true;
        }

        report.ranges_loaded = scratch.range_count();
        self.ctx.live_map.merge(scratch);
        self.ctx.metrics.add_ranges_recovered(report.ranges_loaded as u64);
        maybe_crash(points::RECOVERY_AFTER_CLASS_MERGE);

        let create_log = match class {
            TableClass::Root => replayed[TableClass::Root.index()],
            TableClass::Metadata => {
                replayed[TableClass::Root.index()] || replayed[TableClass::Metadata.index()]
            }
            TableClass::System => replayed[TableClass::System.index()],
            TableClass::User => true,
        };
        if create_log {
            self.ctx.get_or_create_commit_log(class)?;
            report.commit_log_created = true;
        }

        self.ctx.barrier.set(class);
        Ok((report, linked))
    }
}
