//! Failover coordinator
//!
//! Serves the master-driven phases of taking over a failed node's ranges:
//!
//! 1. `phantom_load`: stage the ranges this node will receive
//! 2. `replay_fragments`: on every surviving node, scan assigned fragments
//!    of the failed node's log and ship pairs to their new owners
//! 3. `phantom_update`: receive those pairs into the staged ranges
//! 4. `phantom_prepare_ranges`: materialize each range and its transfer
//!    log, link the transfer log into this node's class log, persist the
//!    entity still flagged PHANTOM
//! 5. `phantom_commit_ranges`: take ownership, persist the entities without
//!    PHANTOM, merge into the live table
//!
//! Every request carries the plan generation. Older generations are
//! ignored and succeed; a newer generation discards the staged state.
//! Load, prepare and commit are idempotent.
//!
//! Lock order: the failover map, then a phantom map, then the live range
//! table. The failover map is never taken while a phantom map is held.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::commitlog::{CommitLog, CommitLogReader};
use crate::crash_point::{maybe_crash, points};
use crate::metalog::{Entity, RangeEntity};
use crate::observability::{Event, Logger, ObservationScope};
use crate::range::{
    LiveRangeTable, QualifiedRangeSpec, Range, RangeFlags, RangeState, TableClass,
    PHANTOM_LOG_SEGMENT,
};
use crate::recovery::NodeContext;

use super::errors::{FailoverError, FailoverResult};
use super::master::{MasterClient, PhaseReport, ReplayOutcome, ReplayProgress, ReplayReport};
use super::ownership::OwnershipWriter;
use super::phantom::{PhantomRange, PhantomState};
use super::phantom_map::{GenerationCheck, PhantomMapState, PhantomRangeMap};
use super::receiver_plan::ReceiverPlan;
use super::replay_buffer::{
    BufferLimits, PhantomUpdate, PhantomUpdateOutcome, PhantomUpdateSender, ReplayBuffer,
};

/// A range that took ownership and waits to be merged.
struct Committing {
    spec: QualifiedRangeSpec,
    range: Arc<Range>,
    transfer_log: PathBuf,
}

pub struct FailoverCoordinator {
    ctx: Arc<NodeContext>,
    master: Arc<dyn MasterClient>,
    peers: Arc<dyn PhantomUpdateSender>,
    ownership: OwnershipWriter,
    maps: Mutex<HashMap<String, Arc<PhantomRangeMap>>>,
}

impl FailoverCoordinator {
    pub fn new(
        ctx: Arc<NodeContext>,
        master: Arc<dyn MasterClient>,
        peers: Arc<dyn PhantomUpdateSender>,
        ownership: OwnershipWriter,
    ) -> Self {
        Self {
            ctx,
            master,
            peers,
            ownership,
            maps: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Staging map for ranges of the failed node `location`.
    pub fn phantom_map(&self, location: &str) -> Option<Arc<PhantomRangeMap>> {
        self.maps.lock().unwrap().get(location).cloned()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.ctx.config.request_timeout()
    }

    fn ignore_stale(&self, phase: &str, location: &str, generation: i64, staged: i64) {
        self.ctx.metrics.increment_stale_requests_ignored();
        Logger::event_owned(
            Event::StaleRequestIgnored,
            &[
                ("generation", generation.to_string()),
                ("location", location.to_string()),
                ("phase", phase.to_string()),
                ("staged_generation", staged.to_string()),
            ],
        );
    }

    fn range_failed(&self, phase: &str, location: &str, generation: i64, spec: &QualifiedRangeSpec, err: &FailoverError) {
        Logger::event_owned(
            Event::PhantomRangeFailed,
            &[
                ("code", err.code().to_string()),
                ("error", err.to_string()),
                ("generation", generation.to_string()),
                ("location", location.to_string()),
                ("phase", phase.to_string()),
                ("range", spec.name()),
            ],
        );
    }

    // =========================================================================
    // LOAD / UPDATE
    // =========================================================================

    /// Stages `specs` of the failed node `location`, each expecting every
    /// fragment in `fragments`. Ranges already live here are left out, but
    /// the map is created and marked loaded even when none remain, so
    /// batches replayed for those ranges are still acknowledged.
    pub fn phantom_load(
        &self,
        location: &str,
        generation: i64,
        fragments: &[u32],
        specs: &[QualifiedRangeSpec],
        states: &[RangeState],
    ) -> FailoverResult<()> {
        self.ctx.barrier.wait_for_user(self.deadline())?;
        if specs.len() != states.len() {
            return Err(FailoverError::InvalidRequest(format!(
                "{} range specs but {} range states",
                specs.len(),
                states.len()
            )));
        }

        let staged: Vec<_> = specs
            .iter()
            .zip(states)
            .filter(|(spec, _)| !self.ctx.live_map.has_range(spec))
            .collect();

        let map = self
            .maps
            .lock()
            .unwrap()
            .entry(location.to_string())
            .or_insert_with(|| Arc::new(PhantomRangeMap::new(location, generation)))
            .clone();
        let mut state = map.lock();
        let staged_generation = state.generation();
        if map.check_generation(&mut state, generation) == GenerationCheck::Stale {
            self.ignore_stale("load", location, generation, staged_generation);
            return Ok(());
        }
        if state.is_loaded() {
            return Ok(());
        }

        let mut loaded = 0;
        for (spec, range_state) in staged {
            let mut phantom = PhantomRange::new(spec.clone(), range_state.clone(), fragments);
            phantom.load()?;
            if state.insert(phantom) {
                loaded += 1;
            }
        }
        state.set_loaded();
        self.ctx.metrics.add_phantom_ranges_loaded(loaded);

        Logger::event_owned(
            Event::PhantomLoaded,
            &[
                ("fragments", fragments.len().to_string()),
                ("generation", generation.to_string()),
                ("location", location.to_string()),
                ("ranges", loaded.to_string()),
            ],
        );
        Ok(())
    }

    /// Receives one batch replayed from the failed node's log.
    pub fn phantom_update(&self, update: &PhantomUpdate) -> FailoverResult<PhantomUpdateOutcome> {
        self.ctx.barrier.wait_for_user(self.deadline())?;
        let map = self
            .phantom_map(&update.location)
            .ok_or_else(|| FailoverError::PhantomRangeMapNotFound {
                location: update.location.clone(),
            })?;

        let mut state = map.lock();
        if update.generation != state.generation() {
            return Err(FailoverError::PlanGenerationMismatch {
                location: update.location.clone(),
                staged: state.generation(),
                requested: update.generation,
            });
        }
        if state.get(&update.range).is_none()
            && (state.is_loaded() || self.ctx.live_map.has_range(&update.range))
        {
            // Live here when the plan was loaded; nothing to stage
            self.ctx.metrics.increment_phantom_updates_accepted();
            return Ok(PhantomUpdateOutcome::Accepted);
        }
        let phantom = state
            .get_mut(&update.range)
            .ok_or_else(|| FailoverError::PhantomRangeNotFound {
                location: update.location.clone(),
                range: update.range.name(),
            })?;

        if phantom.add(update.fragment_id, update.pairs.clone(), update.more)? {
            self.ctx.metrics.increment_phantom_updates_accepted();
            Ok(PhantomUpdateOutcome::Accepted)
        } else {
            self.ctx.metrics.increment_phantom_updates_duplicate();
            Logger::event_owned(
                Event::FragmentAlreadyProcessed,
                &[
                    ("fragment_id", update.fragment_id.to_string()),
                    ("location", update.location.clone()),
                    ("range", update.range.name()),
                ],
            );
            Ok(PhantomUpdateOutcome::FragmentAlreadyProcessed)
        }
    }

    // =========================================================================
    // PREPARE
    // =========================================================================

    /// Runs prepare on a blocking worker and reports the outcome to the master.
    pub fn phantom_prepare_ranges(
        self: &Arc<Self>,
        op_id: i64,
        location: String,
        generation: i64,
        specs: Vec<QualifiedRangeSpec>,
    ) -> JoinHandle<PhaseReport> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let report = this.prepare_ranges(op_id, &location, generation, &specs);
            if let Err(e) = this.master.phantom_prepare_complete(&report) {
                Logger::warn(
                    "MASTER_CALLBACK_FAILED",
                    &[("callback", "phantom_prepare_complete"), ("error", &e.to_string())],
                );
            }
            report
        })
    }

    pub fn prepare_ranges(
        &self,
        op_id: i64,
        location: &str,
        generation: i64,
        specs: &[QualifiedRangeSpec],
    ) -> PhaseReport {
        let scope = ObservationScope::with_owned_fields(
            "PHANTOM_PREPARE",
            vec![
                ("generation", generation.to_string()),
                ("location", location.to_string()),
                ("op_id", op_id.to_string()),
            ],
        );
        let mut report = PhaseReport::new(op_id, location, generation);
        if let Err(e) = self.prepare_all(op_id, location, generation, specs, &mut report) {
            report.fail_all(specs, &e);
        }
        close_scope(scope, &report);
        report
    }

    fn prepare_all(
        &self,
        op_id: i64,
        location: &str,
        generation: i64,
        specs: &[QualifiedRangeSpec],
        report: &mut PhaseReport,
    ) -> FailoverResult<()> {
        self.ctx.barrier.wait_for_user(self.deadline())?;
        if self.ctx.live_map.live(specs) {
            report.succeed_all(specs);
            return Ok(());
        }

        let map = self
            .phantom_map(location)
            .ok_or_else(|| FailoverError::PhantomRangeMapNotFound {
                location: location.to_string(),
            })?;
        let mut state = map.lock();
        let staged = state.generation();
        match map.check_generation(&mut state, generation) {
            GenerationCheck::Stale => {
                self.ignore_stale("prepare", location, generation, staged);
                report.succeed_all(specs);
                return Ok(());
            }
            GenerationCheck::Newer => {
                return Err(FailoverError::PlanGenerationMismatch {
                    location: location.to_string(),
                    staged,
                    requested: generation,
                })
            }
            GenerationCheck::Current => {}
        }
        if state.is_prepared() {
            report.succeed_all(specs);
            return Ok(());
        }

        for spec in specs {
            let result = if self.ctx.live_map.has_range(spec) {
                Ok(())
            } else {
                self.prepare_range(op_id, location, &mut state, spec)
            };
            if let Err(e) = &result {
                self.range_failed("prepare", location, generation, spec, e);
            }
            report.record(spec.clone(), result);
        }

        if state.ranges().all(|p| p.state() >= PhantomState::Prepared) {
            state.set_prepared();
        }
        Ok(())
    }

    fn prepare_range(
        &self,
        op_id: i64,
        location: &str,
        state: &mut PhantomMapState,
        spec: &QualifiedRangeSpec,
    ) -> FailoverResult<()> {
        let phantom = state
            .get_mut(spec)
            .ok_or_else(|| FailoverError::PhantomRangeNotFound {
                location: location.to_string(),
                range: spec.name(),
            })?;
        if phantom.state() >= PhantomState::Prepared {
            return Ok(());
        }
        if phantom.state() == PhantomState::Loaded {
            self.populate(op_id, phantom)?;
        }
        self.link(location, phantom)
    }

    /// Builds the range from the buffered batches and writes its transfer log.
    fn populate(&self, op_id: i64, phantom: &mut PhantomRange) -> FailoverResult<()> {
        if !phantom.all_fragments_received() {
            return Err(FailoverError::FragmentsIncomplete {
                range: phantom.spec().name(),
                missing: phantom.missing_fragments(),
            });
        }
        let spec = phantom.spec().clone();
        let transfer_log = self.transfer_log_dir(&spec, op_id);

        let mut range_state = phantom.range_state().clone();
        range_state.flags.insert(RangeFlags::PHANTOM);
        range_state.transfer_log = Some(transfer_log.clone());
        let mut entity = RangeEntity::new(self.ctx.metalog()?.next_entity_id(), spec.clone(), range_state);
        entity.load_acknowledged = false;

        let range = Arc::new(Range::new(entity));
        for kv in phantom.buffered_pairs() {
            range.add(kv);
        }

        let log = CommitLog::create(
            &transfer_log,
            self.ctx.config.cluster_id,
            self.ctx.config.commit_log_roll_limit,
        )?;
        log.write(&spec.table, &range.cells(), range.latest_revision())?;
        log.close()?;

        phantom.set_populated(range, transfer_log)?;
        maybe_crash(points::PREPARE_AFTER_POPULATE);
        Ok(())
    }

    /// Links the transfer log into this node's class log and persists the
    /// entity, PHANTOM still set.
    fn link(&self, location: &str, phantom: &mut PhantomRange) -> FailoverResult<()> {
        let out_of_order = || FailoverError::PhaseOutOfOrder {
            range: phantom.spec().name(),
            state: phantom.state().state_name(),
            phase: "prepare",
        };
        let range = phantom.range().ok_or_else(out_of_order)?;
        let transfer_log = phantom
            .transfer_log()
            .map(Path::to_path_buf)
            .ok_or_else(out_of_order)?;

        if range.cell_count() > 0 {
            let log = self.ctx.get_or_create_commit_log(phantom.spec().class())?;
            log.link_log(self.ctx.config.cluster_id, &transfer_log)?;
            maybe_crash(points::PREPARE_AFTER_LINK);
        }

        self.ctx
            .metalog()?
            .record_state(&[Entity::Range(range.entity())])?;
        phantom.set_prepared()?;
        self.ctx.metrics.increment_phantom_ranges_prepared();

        Logger::event_owned(
            Event::PhantomRangePrepared,
            &[
                ("cells", range.cell_count().to_string()),
                ("location", location.to_string()),
                ("range", phantom.spec().name()),
                ("transfer_log", transfer_log.display().to_string()),
            ],
        );
        Ok(())
    }

    /// `<log_dir>/phantom/<table_id>/<range digest>-<op_id>-<uuid>`
    fn transfer_log_dir(&self, spec: &QualifiedRangeSpec, op_id: i64) -> PathBuf {
        let digest = Sha256::digest(spec.name().as_bytes());
        let short: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        self.ctx
            .config
            .log_dir()
            .join(PHANTOM_LOG_SEGMENT)
            .join(&spec.table.id)
            .join(format!("{}-{}-{}", short, op_id, Uuid::new_v4()))
    }

    // =========================================================================
    // COMMIT
    // =========================================================================

    /// Runs commit on a blocking worker and reports the outcome to the master.
    pub fn phantom_commit_ranges(
        self: &Arc<Self>,
        op_id: i64,
        location: String,
        generation: i64,
        specs: Vec<QualifiedRangeSpec>,
    ) -> JoinHandle<PhaseReport> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let report = this.commit_ranges(op_id, &location, generation, &specs);
            if let Err(e) = this.master.phantom_commit_complete(&report) {
                Logger::warn(
                    "MASTER_CALLBACK_FAILED",
                    &[("callback", "phantom_commit_complete"), ("error", &e.to_string())],
                );
            }
            report
        })
    }

    pub fn commit_ranges(
        &self,
        op_id: i64,
        location: &str,
        generation: i64,
        specs: &[QualifiedRangeSpec],
    ) -> PhaseReport {
        let scope = ObservationScope::with_owned_fields(
            "PHANTOM_COMMIT",
            vec![
                ("generation", generation.to_string()),
                ("location", location.to_string()),
                ("op_id", op_id.to_string()),
            ],
        );
        let mut report = PhaseReport::new(op_id, location, generation);
        if let Err(e) = self.commit_all(location, generation, specs, &mut report) {
            report.fail_all(specs, &e);
        }
        close_scope(scope, &report);
        report
    }

    fn commit_all(
        &self,
        location: &str,
        generation: i64,
        specs: &[QualifiedRangeSpec],
        report: &mut PhaseReport,
    ) -> FailoverResult<()> {
        self.ctx.barrier.wait_for_system(self.deadline())?;
        if self.ctx.live_map.live(specs) {
            Logger::event_owned(
                Event::PhantomCommitNoop,
                &[
                    ("generation", generation.to_string()),
                    ("location", location.to_string()),
                    ("ranges", specs.len().to_string()),
                ],
            );
            if let Some(map) = self.phantom_map(location) {
                let idle = {
                    let state = map.lock();
                    let idle = state.generation() == generation
                        && state.ranges().all(|p| p.state() == PhantomState::Committed);
                    idle
                };
                if idle {
                    self.discard_map(location, &map);
                }
            }
            report.succeed_all(specs);
            return Ok(());
        }

        let map = self
            .phantom_map(location)
            .ok_or_else(|| FailoverError::PhantomRangeMapNotFound {
                location: location.to_string(),
            })?;
        // Held until the ranges are merged: a concurrent commit of the same
        // ranges waits here and then takes the live fast path below.
        let mut state = map.lock();
        let staged = state.generation();
        match map.check_generation(&mut state, generation) {
            GenerationCheck::Stale => {
                self.ignore_stale("commit", location, generation, staged);
                report.succeed_all(specs);
                return Ok(());
            }
            GenerationCheck::Newer => {
                return Err(FailoverError::PlanGenerationMismatch {
                    location: location.to_string(),
                    staged,
                    requested: generation,
                })
            }
            GenerationCheck::Current => {}
        }
        if self.ctx.live_map.live(specs) {
            report.succeed_all(specs);
            return Ok(());
        }
        let committing = self.select_prepared(location, generation, &state, specs, report);

        let mut owned = Vec::with_capacity(committing.len());
        for item in committing {
            match self
                .ownership
                .take_ownership(&item.spec, &self.ctx.config.location)
            {
                Ok(()) => owned.push(item),
                Err(e) => {
                    self.range_failed("commit", location, generation, &item.spec, &e);
                    report.record(item.spec, Err(e));
                }
            }
        }
        if owned.is_empty() {
            return Ok(());
        }
        maybe_crash(points::COMMIT_AFTER_OWNERSHIP);

        if let Err(e) = self.merge_committed(&owned) {
            for item in &owned {
                self.range_failed("commit", location, generation, &item.spec, &e);
                report.record(item.spec.clone(), Err(e.clone()));
            }
            return Ok(());
        }
        maybe_crash(points::COMMIT_AFTER_MERGE);

        for item in &owned {
            if let Some(phantom) = state.get_mut(&item.spec) {
                phantom.set_committed()?;
            }
            report.record(item.spec.clone(), Ok(()));
        }
        let finished = state.ranges().all(|p| p.state() == PhantomState::Committed);
        drop(state);

        if finished {
            self.discard_map(location, &map);
        }
        self.ctx.maintenance.schedule_immediate();
        self.ctx.metrics.add_phantom_ranges_committed(owned.len() as u64);

        Logger::event_owned(
            Event::PhantomCommitted,
            &[
                ("generation", generation.to_string()),
                ("location", location.to_string()),
                ("map_discarded", finished.to_string()),
                ("ranges", owned.len().to_string()),
            ],
        );
        Ok(())
    }

    /// Forgets `map` unless a newer plan already replaced it.
    fn discard_map(&self, location: &str, map: &Arc<PhantomRangeMap>) {
        let mut maps = self.maps.lock().unwrap();
        if maps.get(location).is_some_and(|m| Arc::ptr_eq(m, map)) {
            maps.remove(location);
        }
    }

    /// Picks the prepared ranges out of the map. Ranges already live or
    /// committed succeed; anything else is recorded as a failure.
    fn select_prepared(
        &self,
        location: &str,
        generation: i64,
        state: &PhantomMapState,
        specs: &[QualifiedRangeSpec],
        report: &mut PhaseReport,
    ) -> Vec<Committing> {
        let mut committing = Vec::new();
        for spec in specs {
            if self.ctx.live_map.has_range(spec) {
                report.record(spec.clone(), Ok(()));
                continue;
            }
            let selected = match state.get(spec) {
                None => Err(FailoverError::PhantomRangeNotFound {
                    location: location.to_string(),
                    range: spec.name(),
                }),
                Some(phantom) if phantom.state() == PhantomState::Committed => {
                    report.record(spec.clone(), Ok(()));
                    continue;
                }
                Some(phantom) => match (phantom.state(), phantom.range(), phantom.transfer_log()) {
                    (PhantomState::Prepared, Some(range), Some(log)) => Ok(Committing {
                        spec: spec.clone(),
                        range,
                        transfer_log: log.to_path_buf(),
                    }),
                    (current, ..) => Err(FailoverError::PhaseOutOfOrder {
                        range: spec.name(),
                        state: current.state_name(),
                        phase: "commit",
                    }),
                },
            };
            match selected {
                Ok(item) => committing.push(item),
                Err(e) => {
                    self.range_failed("commit", location, generation, spec, &e);
                    report.record(spec.clone(), Err(e));
                }
            }
        }
        committing
    }

    /// Persists the committed entities together with the RemoveOkLogs
    /// entity and merges the ranges, all under the live table's lock.
    fn merge_committed(&self, owned: &[Committing]) -> FailoverResult<()> {
        let metalog = self.ctx.metalog()?;
        let scratch = LiveRangeTable::new();
        let mut entities = Vec::with_capacity(owned.len() + 1);
        for item in owned {
            let entity = item.range.update_entity(|e| {
                e.state.flags.remove(RangeFlags::PHANTOM);
                e.needs_compaction = true;
                e.load_acknowledged = false;
            });
            entities.push(Entity::Range(entity));
            scratch.add_range(item.range.clone());
        }

        self.ctx.live_map.merge_with(scratch, || -> FailoverResult<()> {
            let remove_ok = self.ctx.update_remove_ok_logs(|logs| {
                for item in owned {
                    logs.insert(item.transfer_log.clone());
                }
            })?;
            entities.push(Entity::RemoveOkLogs(remove_ok));
            metalog.record_state(&entities)?;
            Ok(())
        })?;
        Ok(())
    }

    // =========================================================================
    // REPLAY
    // =========================================================================

    /// Runs a replay on a blocking worker and reports the outcome to the master.
    #[allow(clippy::too_many_arguments)]
    pub fn replay_fragments(
        self: &Arc<Self>,
        op_id: i64,
        location: String,
        generation: i64,
        class: TableClass,
        fragments: Vec<u32>,
        plan: ReceiverPlan,
        timeout: Duration,
    ) -> JoinHandle<ReplayReport> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = this.run_replay(op_id, &location, generation, class, &fragments, Arc::new(plan), timeout);
            let report = ReplayReport {
                op_id,
                location,
                generation,
                class,
                fragments,
                result,
            };
            if let Err(e) = this.master.replay_complete(&report) {
                Logger::warn(
                    "MASTER_CALLBACK_FAILED",
                    &[("callback", "replay_complete"), ("error", &e.to_string())],
                );
            }
            report
        })
    }

    /// Scans `fragments` of the failed node's `class` log and delivers every
    /// pair the plan covers. Must run off the async runtime's worker threads.
    #[allow(clippy::too_many_arguments)]
    pub fn run_replay(
        &self,
        op_id: i64,
        location: &str,
        generation: i64,
        class: TableClass,
        fragments: &[u32],
        plan: Arc<ReceiverPlan>,
        timeout: Duration,
    ) -> FailoverResult<ReplayOutcome> {
        let scope = ObservationScope::with_owned_fields(
            "REPLAY_FRAGMENTS",
            vec![
                ("class", class.as_str().to_string()),
                ("fragments", format!("{:?}", fragments)),
                ("generation", generation.to_string()),
                ("location", location.to_string()),
            ],
        );
        match self.scan(op_id, location, generation, class, fragments, plan, timeout) {
            Ok(outcome) => {
                scope.complete_with_fields(&[
                    ("batches", &outcome.batches_sent.to_string()),
                    ("pairs_sent", &outcome.pairs_sent.to_string()),
                ]);
                Ok(outcome)
            }
            Err(e) => {
                Logger::event_owned(
                    Event::ReplayAborted,
                    &[
                        ("code", e.code().to_string()),
                        ("generation", generation.to_string()),
                        ("location", location.to_string()),
                    ],
                );
                if e.is_fatal() {
                    scope.fail_fatal(&e.to_string());
                } else {
                    scope.fail(&e.to_string());
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn scan(
        &self,
        op_id: i64,
        location: &str,
        generation: i64,
        class: TableClass,
        fragments: &[u32],
        plan: Arc<ReceiverPlan>,
        timeout: Duration,
    ) -> FailoverResult<ReplayOutcome> {
        let config = &self.ctx.config;
        let deadline = Instant::now() + timeout;
        let dir = config.server_log_dir(location).join(class.as_str());
        let mut reader = CommitLogReader::open_fragments(&dir, fragments, config.skip_corrupt_fragments)?;

        let mut buffer = ReplayBuffer::new(
            location,
            generation,
            plan,
            BufferLimits {
                per_range: config.replay_flush_limit_per_range,
                aggregate: config.replay_flush_limit_aggregate,
                channel_capacity: config.replay_channel_capacity,
            },
            config.delivery_retry.policy(),
            self.peers.clone(),
        );
        let mut progress = ReplayProgress::default();
        let mut last_status = Instant::now();

        loop {
            let block = match reader.next() {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(e) => {
                    let err = FailoverError::from(e);
                    if let FailoverError::CorruptFragment { fragment_id, .. } = &err {
                        Logger::event_owned(
                            Event::CommitLogCorruption,
                            &[
                                ("class", class.as_str().to_string()),
                                ("fragment", fragment_id.to_string()),
                                ("location", location.to_string()),
                            ],
                        );
                        if let Err(flush_err) = buffer.fail_fragment(*fragment_id) {
                            Logger::warn(
                                "REPLAY_FLUSH_FAILED",
                                &[("error", &flush_err.to_string()), ("location", location)],
                            );
                        }
                    } else {
                        buffer.abort();
                    }
                    return Err(err);
                }
            };

            progress.blocks_read += 1;
            progress.current_fragment = Some(block.fragment_id);
            for kv in block.pairs {
                match buffer.add(block.fragment_id, &block.table.id, kv) {
                    Ok(true) => {}
                    Ok(false) => progress.pairs_skipped += 1,
                    Err(e) => {
                        buffer.abort();
                        return Err(e);
                    }
                }
            }

            if Instant::now() >= deadline {
                buffer.abort();
                return Err(FailoverError::Timeout {
                    what: format!("replay of {} {} log", location, class),
                });
            }
            if last_status.elapsed() >= config.replay_status_interval() {
                progress.pairs_sent = buffer.stats().pairs_sent;
                self.report_progress(op_id, location, generation, &progress);
                last_status = Instant::now();
            }
        }

        if let Err(e) = buffer.close_fragments(fragments) {
            buffer.abort();
            return Err(e);
        }
        let stats = buffer.finish()?;
        maybe_crash(points::REPLAY_AFTER_FLUSH);

        self.ctx.metrics.add_replay_batches_sent(stats.batches_sent);
        self.ctx.metrics.add_pairs_skipped(progress.pairs_skipped);
        self.ctx
            .metrics
            .add_corrupt_fragments_skipped(reader.skipped_fragments().len() as u64);

        Ok(ReplayOutcome {
            blocks_read: progress.blocks_read,
            pairs_sent: stats.pairs_sent,
            pairs_skipped: progress.pairs_skipped,
            batches_sent: stats.batches_sent,
            batches_duplicate: stats.batches_duplicate,
            skipped_fragments: reader.skipped_fragments().to_vec(),
        })
    }

    fn report_progress(&self, op_id: i64, location: &str, generation: i64, progress: &ReplayProgress) {
        Logger::event_owned(
            Event::ReplayStatus,
            &[
                ("blocks", progress.blocks_read.to_string()),
                ("generation", generation.to_string()),
                ("location", location.to_string()),
                ("pairs_sent", progress.pairs_sent.to_string()),
            ],
        );
        if let Err(e) = self.master.replay_status(op_id, location, generation, progress) {
            Logger::warn(
                "MASTER_CALLBACK_FAILED",
                &[("callback", "replay_status"), ("error", &e.to_string())],
            );
        }
    }
}

fn close_scope(scope: ObservationScope<'_>, report: &PhaseReport) {
    match report.first_error() {
        None => scope.complete_with_fields(&[("ranges", &report.results.len().to_string())]),
        Some(e) if e.is_fatal() => scope.fail_fatal(&e.to_string()),
        Some(e) => scope.fail(&e.to_string()),
    }
}

impl std::fmt::Debug for FailoverCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCoordinator")
            .field("location", &self.ctx.config.location)
            .field("staging", &self.maps.lock().unwrap().len())
            .finish()
    }
}
