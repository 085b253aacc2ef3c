//! Node context
//!
//! Everything a node's recovery and failover components share: the live
//! range table, the replay barrier, the per-class commit logs, the metalog
//! handle and the RemoveOkLogs bookkeeping. Built once at startup and
//! passed around as `Arc<NodeContext>`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::commitlog::CommitLog;
use crate::config::NodeConfig;
use crate::metalog::{MetaLogStore, RemoveOkLogsEntity};
use crate::observability::{Event, Logger, MetricsRegistry};
use crate::range::{LiveRangeTable, MaintenanceQueue, PermissiveCatalog, TableCatalog, TableClass};

use super::barrier::LogReplayBarrier;
use super::errors::{RecoveryError, RecoveryResult};

pub struct NodeContext {
    pub config: NodeConfig,
    pub live_map: LiveRangeTable,
    pub barrier: LogReplayBarrier,
    pub maintenance: MaintenanceQueue,
    pub metrics: MetricsRegistry,
    pub catalog: Arc<dyn TableCatalog>,
    logs: RwLock<[Option<Arc<CommitLog>>; 4]>,
    metalog: RwLock<Option<Arc<dyn MetaLogStore>>>,
    remove_ok_logs: Mutex<Option<RemoveOkLogsEntity>>,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_catalog(config, Arc::new(PermissiveCatalog))
    }

    pub fn with_catalog(config: NodeConfig, catalog: Arc<dyn TableCatalog>) -> Self {
        Self {
            config,
            live_map: LiveRangeTable::new(),
            barrier: LogReplayBarrier::new(),
            maintenance: MaintenanceQueue::new(),
            metrics: MetricsRegistry::new(),
            catalog,
            logs: RwLock::new([None, None, None, None]),
            metalog: RwLock::new(None),
            remove_ok_logs: Mutex::new(None),
        }
    }

    /// Directory of this node's `class` commit log.
    pub fn class_log_dir(&self, class: TableClass) -> PathBuf {
        self.config.log_dir().join(class.as_str())
    }

    pub fn commit_log(&self, class: TableClass) -> Option<Arc<CommitLog>> {
        self.logs.read().unwrap()[class.index()].clone()
    }

    /// Returns the `class` commit log, creating it if this node has none.
    pub fn get_or_create_commit_log(&self, class: TableClass) -> RecoveryResult<Arc<CommitLog>> {
        if let Some(log) = self.commit_log(class) {
            return Ok(log);
        }
        let mut logs = self.logs.write().unwrap();
        if let Some(log) = &logs[class.index()] {
            return Ok(log.clone());
        }
        let log = Arc::new(CommitLog::create_with_retry(
            &self.class_log_dir(class),
            self.config.cluster_id,
            self.config.commit_log_roll_limit,
            self.config.delivery_retry.policy(),
        )?);
        logs[class.index()] = Some(log.clone());
        Ok(log)
    }

    pub fn install_metalog(&self, metalog: Arc<dyn MetaLogStore>) {
        *self.metalog.write().unwrap() = Some(metalog);
    }

    pub fn metalog(&self) -> RecoveryResult<Arc<dyn MetaLogStore>> {
        self.metalog
            .read()
            .unwrap()
            .clone()
            .ok_or(RecoveryError::MetaLog(crate::metalog::MetaLogError::Closed))
    }

    pub fn remove_ok_logs(&self) -> Option<RemoveOkLogsEntity> {
        self.remove_ok_logs.lock().unwrap().clone()
    }

    pub fn set_remove_ok_logs(&self, entity: RemoveOkLogsEntity) {
        *self.remove_ok_logs.lock().unwrap() = Some(entity);
    }

    /// Runs `f` on the RemoveOkLogs entity, creating it first if needed.
    pub fn update_remove_ok_logs<F>(&self, f: F) -> RecoveryResult<RemoveOkLogsEntity>
    where
        F: FnOnce(&mut RemoveOkLogsEntity),
    {
        let mut slot = self.remove_ok_logs.lock().unwrap();
        let mut entity = match slot.take() {
            Some(entity) => entity,
            None => RemoveOkLogsEntity::new(self.metalog()?.next_entity_id(), BTreeSet::new()),
        };
        f(&mut entity);
        entity.touch();
        *slot = Some(entity.clone());
        Ok(entity)
    }

    /// Closes logs in reverse dependency order (user, system, metadata,
    /// root), then the metalog. Every log is attempted; the first error is
    /// returned.
    pub fn shutdown(&self) -> RecoveryResult<()> {
        Logger::event(Event::ShutdownStart, &[("location", &self.config.location)]);
        let mut first_error: Option<RecoveryError> = None;

        let logs = self.logs.read().unwrap().clone();
        for class in TableClass::ALL.iter().rev() {
            if let Some(log) = &logs[class.index()] {
                if let Err(e) = log.close() {
                    Logger::error(
                        "COMMITLOG_CLOSE_FAILED",
                        &[("class", class.as_str()), ("error", &e.to_string())],
                    );
                    first_error.get_or_insert(e.into());
                }
            }
        }

        if let Some(metalog) = self.metalog.read().unwrap().clone() {
            if let Err(e) = metalog.close() {
                first_error.get_or_insert(e.into());
            }
        }

        Logger::event(Event::ShutdownComplete, &[("location", &self.config.location)]);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("location", &self.config.location)
            .field("ranges", &self.live_map.range_count())
            .finish()
    }
}
