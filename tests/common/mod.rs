//! Shared harness for multi-node recovery and failover tests
//!
//! A `Cluster` is one shared top-level directory that several nodes
//! recover from. Nodes reach each other's `phantom_update` through an
//! in-process router, and the master and ownership stores only record
//! what they are told.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use rangekeeper::commitlog::{CommitLog, KeyValue};
use rangekeeper::config::NodeConfig;
use rangekeeper::failover::{
    CoordinationService, FailoverCoordinator, FailoverError, FailoverResult, MasterClient,
    MetadataTable, OwnershipWriter, PhaseReport, PhantomUpdate, PhantomUpdateOutcome,
    PhantomUpdateSender, ReceiverPlan, ReplayProgress, ReplayReport,
};
use rangekeeper::metalog::{Entity, FileMetaLog, MetaLogResult, MetaLogStore};
use rangekeeper::range::{
    QualifiedRangeSpec, RangeSpec, RangeState, TableClass, TableIdentifier, END_ROW_MARKER,
};
use rangekeeper::recovery::{LocalRecoveryCoordinator, NodeContext, RecoveryReport};
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

pub const USER_TABLE: &str = "7";
pub const TOPLEVEL: &str = "/hypertable";

pub fn user_table() -> TableIdentifier {
    TableIdentifier::new(USER_TABLE, 0)
}

pub fn user_range(start: &str, end: &str) -> QualifiedRangeSpec {
    QualifiedRangeSpec::new(user_table(), RangeSpec::new(start, end))
}

/// `("", "m"]` and `("m", end]` of the user table.
pub fn split_user_table() -> (QualifiedRangeSpec, QualifiedRangeSpec) {
    (user_range("", "m"), user_range("m", END_ROW_MARKER))
}

pub fn cell(row: &str, revision: i64) -> KeyValue {
    KeyValue::new(row, "cf:q", revision, revision, format!("value-{}", row).into_bytes())
}

/// Corrupts the last block of a fragment file by flipping its final byte.
pub fn corrupt_fragment(log_dir: &Path, fragment_id: u32) {
    let path = log_dir.join(fragment_id.to_string());
    let mut data = fs::read(&path).expect("Failed to read fragment");
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&path, data).expect("Failed to write fragment");
}

// =============================================================================
// Recording doubles
// =============================================================================

#[derive(Default)]
pub struct RecordingMaster {
    pub statuses: Mutex<Vec<(i64, String, ReplayProgress)>>,
    pub replays: Mutex<Vec<ReplayReport>>,
    pub prepares: Mutex<Vec<PhaseReport>>,
    pub commits: Mutex<Vec<PhaseReport>>,
}

impl MasterClient for RecordingMaster {
    fn replay_status(
        &self,
        op_id: i64,
        location: &str,
        _generation: i64,
        progress: &ReplayProgress,
    ) -> FailoverResult<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((op_id, location.to_string(), progress.clone()));
        Ok(())
    }

    fn replay_complete(&self, report: &ReplayReport) -> FailoverResult<()> {
        self.replays.lock().unwrap().push(report.clone());
        Ok(())
    }

    fn phantom_prepare_complete(&self, report: &PhaseReport) -> FailoverResult<()> {
        self.prepares.lock().unwrap().push(report.clone());
        Ok(())
    }

    fn phantom_commit_complete(&self, report: &PhaseReport) -> FailoverResult<()> {
        self.commits.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Records every ownership write, from either store, optionally taking
/// `delay` per write.
#[derive(Default)]
pub struct RecordingOwnership {
    writes: Mutex<Vec<String>>,
    delay_ms: AtomicU64,
}

impl RecordingOwnership {
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn record(&self, write: String) {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        self.writes.lock().unwrap().push(write);
    }
}

impl CoordinationService for RecordingOwnership {
    fn attr_set(&self, path: &str, attr: &str, value: &str) -> FailoverResult<()> {
        self.record(format!("attr {} {}={}", path, attr, value));
        Ok(())
    }
}

impl MetadataTable for RecordingOwnership {
    fn set_cell(&self, row: &str, column: &str, value: &str) -> FailoverResult<()> {
        self.record(format!("cell {} {}={}", row, column, value));
        Ok(())
    }

    fn flush(&self) -> FailoverResult<()> {
        Ok(())
    }
}

/// Routes `phantom_update` to the coordinator registered for a location.
#[derive(Default)]
pub struct PeerRouter {
    nodes: Mutex<HashMap<String, Weak<FailoverCoordinator>>>,
    delivered: AtomicU64,
}

impl PeerRouter {
    pub fn register(&self, location: &str, coordinator: &Arc<FailoverCoordinator>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(location.to_string(), Arc::downgrade(coordinator));
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl PhantomUpdateSender for PeerRouter {
    fn phantom_update(
        &self,
        destination: &str,
        update: &PhantomUpdate,
    ) -> FailoverResult<PhantomUpdateOutcome> {
        let node = self
            .nodes
            .lock()
            .unwrap()
            .get(destination)
            .and_then(Weak::upgrade)
            .ok_or_else(|| FailoverError::Transport {
                destination: destination.to_string(),
                reason: "no such node".into(),
            })?;
        let outcome = node.phantom_update(update)?;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

/// Metalog that counts writes on top of the node's file metalog.
pub struct CountingMetaLog {
    inner: FileMetaLog,
    writes: AtomicU64,
}

impl CountingMetaLog {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl MetaLogStore for CountingMetaLog {
    fn get_entities(&self) -> MetaLogResult<Vec<Entity>> {
        self.inner.get_entities()
    }

    fn record_state(&self, entities: &[Entity]) -> MetaLogResult<()> {
        if !entities.is_empty() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.record_state(entities)
    }

    fn record_removal(&self, entity: &Entity) -> MetaLogResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.record_removal(entity)
    }

    fn next_entity_id(&self) -> i64 {
        self.inner.next_entity_id()
    }

    fn close(&self) -> MetaLogResult<()> {
        self.inner.close()
    }
}

// =============================================================================
// Cluster
// =============================================================================

pub struct TestNode {
    pub coordinator: Arc<FailoverCoordinator>,
    pub metalog: Arc<CountingMetaLog>,
    pub report: RecoveryReport,
}

impl TestNode {
    pub fn ctx(&self) -> &Arc<NodeContext> {
        self.coordinator.context()
    }

    pub fn location(&self) -> &str {
        &self.ctx().config.location
    }

    pub fn cells(&self, spec: &QualifiedRangeSpec) -> Vec<String> {
        self.ctx()
            .live_map
            .get_range(spec)
            .map(|range| range.cells().iter().map(|kv| kv.row().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn shutdown(self) {
        self.ctx().shutdown().expect("Failed to shut down node");
    }
}

pub struct Cluster {
    root: TempDir,
    pub master: Arc<RecordingMaster>,
    pub router: Arc<PeerRouter>,
    pub ownership: Arc<RecordingOwnership>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("Failed to create temp dir"),
            master: Arc::new(RecordingMaster::default()),
            router: Arc::new(PeerRouter::default()),
            ownership: Arc::new(RecordingOwnership::default()),
        }
    }

    pub fn toplevel_dir(&self) -> PathBuf {
        self.root.path().join("hypertable")
    }

    pub fn config(&self, location: &str) -> NodeConfig {
        NodeConfig::new(location, self.toplevel_dir())
    }

    pub fn start(&self, location: &str) -> TestNode {
        self.start_with(self.config(location))
    }

    /// Recovers a node from its on-disk state and registers it with the
    /// router.
    pub fn start_with(&self, config: NodeConfig) -> TestNode {
        let location = config.location.clone();
        let metalog = Arc::new(CountingMetaLog {
            inner: FileMetaLog::open(&config.log_dir(), config.metalog_max_files)
                .expect("Failed to open metalog"),
            writes: AtomicU64::new(0),
        });
        let ctx = Arc::new(NodeContext::new(config));
        let report = LocalRecoveryCoordinator::new(ctx.clone())
            .recover_with(metalog.clone())
            .expect("Local recovery failed");

        let coordinator = Arc::new(FailoverCoordinator::new(
            ctx,
            self.master.clone(),
            self.router.clone(),
            OwnershipWriter::new(self.ownership.clone(), self.ownership.clone(), TOPLEVEL),
        ));
        self.router.register(&location, &coordinator);
        TestNode {
            coordinator,
            metalog,
            report,
        }
    }

    /// Class log directory of `location`, whether or not it is running.
    pub fn log_dir(&self, location: &str, class: TableClass) -> PathBuf {
        self.config(location)
            .server_log_dir(location)
            .join(class.as_str())
    }

    /// Writes a user log for a node that is not running, one fragment per
    /// entry of `fragments`, one block per fragment. Fragment ids start at 0.
    pub fn write_log(&self, location: &str, fragments: &[&[&str]]) -> PathBuf {
        let dir = self.log_dir(location, TableClass::User);
        let log = CommitLog::create(&dir, 1, 1 << 20).expect("Failed to create log");
        let mut revision = 0;
        for rows in fragments {
            let cells: Vec<_> = rows
                .iter()
                .map(|row| {
                    revision += 1;
                    cell(row, revision)
                })
                .collect();
            log.write(&user_table(), &cells, revision)
                .expect("Failed to write block");
            log.roll().expect("Failed to roll log");
        }
        log.close().expect("Failed to close log");
        dir
    }
}

/// Plan sending `("", "m"]` to `low` and `("m", end]` to `high`.
pub fn two_way_plan(low: &str, high: &str) -> ReceiverPlan {
    let (a, b) = split_user_table();
    let mut plan = ReceiverPlan::new();
    plan.add(low, a, RangeState::steady());
    plan.add(high, b, RangeState::steady());
    plan
}

/// Stages every range of `plan` on the node it is assigned to.
pub fn load_plan(nodes: &[&TestNode], failed: &str, generation: i64, fragments: &[u32], plan: &ReceiverPlan) {
    for node in nodes {
        let specs = plan.specs_for(node.location());
        if specs.is_empty() {
            continue;
        }
        node.coordinator
            .phantom_load(failed, generation, fragments, &specs, &plan.states_for(node.location()))
            .expect("phantom_load failed");
    }
}
