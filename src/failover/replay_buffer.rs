//! Replay buffer
//!
//! Groups the pairs scanned from a failed node's log by destination range
//! and ships them to the surviving node that now owns each range.
//!
//! The scanning thread never talks to peers itself. Each destination
//! location gets a flush worker thread fed through a bounded channel, so a
//! slow peer applies backpressure to the scan instead of growing memory.
//!
//! Batching rules:
//! - a range's pending batch is sent with `more = true` once it reaches the
//!   per-range limit, and every pending batch is sent once the total reaches
//!   the aggregate limit
//! - when the fragment changes, or the scan ends, every range of the plan
//!   receives a final `more = false` batch, empty if nothing is pending, so
//!   each destination knows the fragment was fully delivered

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use crate::commitlog::KeyValue;
use crate::observability::Logger;
use crate::range::QualifiedRangeSpec;
use crate::util::retry::RetryPolicy;

use super::errors::{FailoverError, FailoverResult};
use super::receiver_plan::ReceiverPlan;

/// One batch of replayed pairs for one phantom range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomUpdate {
    /// Failed node the pairs were read from
    pub location: String,
    pub generation: i64,
    pub range: QualifiedRangeSpec,
    pub fragment_id: u32,
    pub pairs: Vec<KeyValue>,
    /// More batches of this fragment follow
    pub more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhantomUpdateOutcome {
    Accepted,
    /// The destination already holds the whole fragment
    FragmentAlreadyProcessed,
}

/// Delivers batches to a destination node's `phantom_update`.
pub trait PhantomUpdateSender: Send + Sync {
    fn phantom_update(
        &self,
        destination: &str,
        update: &PhantomUpdate,
    ) -> FailoverResult<PhantomUpdateOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub per_range: u64,
    pub aggregate: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub batches_sent: u64,
    pub batches_duplicate: u64,
    pub pairs_sent: u64,
}

#[derive(Default)]
struct Delivery {
    error: Mutex<Option<FailoverError>>,
    batches_sent: AtomicU64,
    batches_duplicate: AtomicU64,
    pairs_sent: AtomicU64,
}

impl Delivery {
    fn fail(&self, err: FailoverError) {
        self.error.lock().unwrap().get_or_insert(err);
    }

    fn error(&self) -> Option<FailoverError> {
        self.error.lock().unwrap().clone()
    }

    fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_duplicate: self.batches_duplicate.load(Ordering::Relaxed),
            pairs_sent: self.pairs_sent.load(Ordering::Relaxed),
        }
    }
}

struct FlushWorker {
    tx: mpsc::Sender<PhantomUpdate>,
    handle: JoinHandle<()>,
}

struct PendingBatch {
    destination: String,
    pairs: Vec<KeyValue>,
    bytes: u64,
}

pub struct ReplayBuffer {
    location: String,
    generation: i64,
    plan: Arc<ReceiverPlan>,
    limits: BufferLimits,
    retry: RetryPolicy,
    sender: Arc<dyn PhantomUpdateSender>,
    pending: BTreeMap<QualifiedRangeSpec, PendingBatch>,
    pending_bytes: u64,
    current_fragment: Option<u32>,
    finished: BTreeSet<u32>,
    workers: BTreeMap<String, FlushWorker>,
    delivery: Arc<Delivery>,
}

impl ReplayBuffer {
    pub fn new(
        location: impl Into<String>,
        generation: i64,
        plan: Arc<ReceiverPlan>,
        limits: BufferLimits,
        retry: RetryPolicy,
        sender: Arc<dyn PhantomUpdateSender>,
    ) -> Self {
        Self {
            location: location.into(),
            generation,
            plan,
            limits,
            retry,
            sender,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            current_fragment: None,
            finished: BTreeSet::new(),
            workers: BTreeMap::new(),
            delivery: Arc::new(Delivery::default()),
        }
    }

    /// Fragment whose pairs are being buffered.
    pub fn current_fragment(&self) -> Option<u32> {
        self.current_fragment
    }

    pub fn stats(&self) -> DeliveryStats {
        self.delivery.stats()
    }

    /// Buffers one pair read from `fragment_id`. Returns `Ok(false)` when
    /// no plan entry covers the pair's row.
    pub fn add(&mut self, fragment_id: u32, table_id: &str, kv: KeyValue) -> FailoverResult<bool> {
        if let Some(err) = self.delivery.error() {
            return Err(err);
        }
        if self.current_fragment.is_some_and(|current| current != fragment_id) {
            self.finish_fragment()?;
        }
        self.current_fragment = Some(fragment_id);

        let plan = self.plan.clone();
        let entry = match plan.lookup(table_id, kv.row()) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        let bytes = kv.encoded_len() as u64;
        let batch = self
            .pending
            .entry(entry.spec.clone())
            .or_insert_with(|| PendingBatch {
                destination: entry.location.clone(),
                pairs: Vec::new(),
                bytes: 0,
            });
        batch.pairs.push(kv);
        batch.bytes += bytes;
        let range_bytes = batch.bytes;
        self.pending_bytes += bytes;

        if range_bytes >= self.limits.per_range {
            self.flush_range(&entry.spec, fragment_id)?;
        }
        if self.pending_bytes >= self.limits.aggregate {
            self.flush_pending(fragment_id)?;
        }
        Ok(true)
    }

    /// Sends the final batch of the current fragment to every plan range.
    pub fn finish_fragment(&mut self) -> FailoverResult<()> {
        let fragment_id = match self.current_fragment.take() {
            Some(id) => id,
            None => return Ok(()),
        };
        let plan = self.plan.clone();
        for entry in plan.entries() {
            let pairs = self
                .pending
                .remove(&entry.spec)
                .map(|batch| batch.pairs)
                .unwrap_or_default();
            self.dispatch(&entry.location, &entry.spec, fragment_id, pairs, false)?;
        }
        self.pending_bytes = 0;
        self.finished.insert(fragment_id);
        Ok(())
    }

    /// Finishes the current fragment, then sends an empty final batch for
    /// every fragment in `fragments` that produced no pairs, so receivers
    /// see each assigned fragment complete.
    pub fn close_fragments(&mut self, fragments: &[u32]) -> FailoverResult<()> {
        self.finish_fragment()?;
        for &fragment_id in fragments {
            if !self.finished.contains(&fragment_id) {
                self.current_fragment = Some(fragment_id);
                self.finish_fragment()?;
            }
        }
        Ok(())
    }

    /// Ends the scan: finishes the current fragment and waits for every
    /// batch to be delivered.
    pub fn finish(mut self) -> FailoverResult<DeliveryStats> {
        let finished = self.finish_fragment();
        let closed = self.close();
        finished?;
        closed
    }

    /// Stops at a corrupt fragment. If the corruption was hit on the first
    /// block of a new fragment, the previous fragment was read in full and
    /// its final batches are still sent; pairs of the corrupt fragment are
    /// dropped.
    pub fn fail_fragment(mut self, fragment_id: u32) -> FailoverResult<DeliveryStats> {
        let finished = if self.current_fragment == Some(fragment_id) {
            self.discard_pending();
            Ok(())
        } else {
            self.finish_fragment()
        };
        let closed = self.close();
        finished?;
        closed
    }

    /// Drops everything pending and stops the flush workers once the
    /// batches already queued are delivered.
    pub fn abort(mut self) {
        self.discard_pending();
        let _ = self.close();
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.current_fragment = None;
    }

    fn flush_range(&mut self, spec: &QualifiedRangeSpec, fragment_id: u32) -> FailoverResult<()> {
        if let Some(batch) = self.pending.remove(spec) {
            self.pending_bytes -= batch.bytes;
            self.dispatch(&batch.destination, spec, fragment_id, batch.pairs, true)?;
        }
        Ok(())
    }

    fn flush_pending(&mut self, fragment_id: u32) -> FailoverResult<()> {
        let specs: Vec<_> = self.pending.keys().cloned().collect();
        for spec in specs {
            self.flush_range(&spec, fragment_id)?;
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        destination: &str,
        spec: &QualifiedRangeSpec,
        fragment_id: u32,
        pairs: Vec<KeyValue>,
        more: bool,
    ) -> FailoverResult<()> {
        if !self.workers.contains_key(destination) {
            let worker = self.spawn_worker(destination)?;
            self.workers.insert(destination.to_string(), worker);
        }
        let update = PhantomUpdate {
            location: self.location.clone(),
            generation: self.generation,
            range: spec.clone(),
            fragment_id,
            pairs,
            more,
        };
        let worker = &self.workers[destination];
        if worker.tx.blocking_send(update).is_err() {
            return Err(self.delivery.error().unwrap_or_else(|| FailoverError::ReplayAborted {
                reason: format!("flush worker for {} stopped", destination),
            }));
        }
        Ok(())
    }

    fn spawn_worker(&self, destination: &str) -> FailoverResult<FlushWorker> {
        let (tx, rx) = mpsc::channel(self.limits.channel_capacity.max(1));
        let destination = destination.to_string();
        let sender = self.sender.clone();
        let retry = self.retry.clone();
        let delivery = self.delivery.clone();
        let handle = thread::Builder::new()
            .name(format!("replay-flush-{}", destination))
            .spawn(move || flush_loop(destination, rx, sender, retry, delivery))
            .map_err(|e| FailoverError::ReplayAborted {
                reason: format!("cannot start flush worker: {}", e),
            })?;
        Ok(FlushWorker { tx, handle })
    }

    fn close(&mut self) -> FailoverResult<DeliveryStats> {
        for (destination, worker) in std::mem::take(&mut self.workers) {
            drop(worker.tx);
            if worker.handle.join().is_err() {
                self.delivery.fail(FailoverError::ReplayAborted {
                    reason: format!("flush worker for {} panicked", destination),
                });
            }
        }
        match self.delivery.error() {
            Some(err) => Err(err),
            None => Ok(self.delivery.stats()),
        }
    }
}

fn flush_loop(
    destination: String,
    mut rx: mpsc::Receiver<PhantomUpdate>,
    sender: Arc<dyn PhantomUpdateSender>,
    retry: RetryPolicy,
    delivery: Arc<Delivery>,
) {
    while let Some(update) = rx.blocking_recv() {
        if delivery.error().is_some() {
            break;
        }
        let result = retry.run(
            |_| sender.phantom_update(&destination, &update),
            FailoverError::is_retryable,
        );
        match result {
            Ok(PhantomUpdateOutcome::Accepted) => {
                delivery.batches_sent.fetch_add(1, Ordering::Relaxed);
                delivery
                    .pairs_sent
                    .fetch_add(update.pairs.len() as u64, Ordering::Relaxed);
            }
            Ok(PhantomUpdateOutcome::FragmentAlreadyProcessed) => {
                delivery.batches_duplicate.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                Logger::warn(
                    "REPLAY_DELIVERY_FAILED",
                    &[
                        ("destination", &destination),
                        ("location", &update.location),
                        ("generation", &update.generation.to_string()),
                        ("range", &update.range.name()),
                        ("fragment_id", &update.fragment_id.to_string()),
                        ("error", &err.to_string()),
                    ],
                );
                delivery.fail(err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::{RangeSpec, RangeState, TableIdentifier, END_ROW_MARKER};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSender {
        updates: Mutex<Vec<(String, PhantomUpdate)>>,
        transient_failures: AtomicU64,
        reject_with: Option<FailoverError>,
    }

    impl PhantomUpdateSender for RecordingSender {
        fn phantom_update(
            &self,
            destination: &str,
            update: &PhantomUpdate,
        ) -> FailoverResult<PhantomUpdateOutcome> {
            if let Some(err) = &self.reject_with {
                return Err(err.clone());
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(FailoverError::Transport {
                    destination: destination.to_string(),
                    reason: "connection reset".into(),
                });
            }
            self.updates
                .lock()
                .unwrap()
                .push((destination.to_string(), update.clone()));
            Ok(PhantomUpdateOutcome::Accepted)
        }
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(String, u32, Vec<String>, bool)> {
            let mut sent: Vec<_> = self
                .updates
                .lock()
                .unwrap()
                .iter()
                .map(|(dest, u)| {
                    let rows = u.pairs.iter().map(|kv| kv.row().to_string()).collect();
                    (dest.clone(), u.fragment_id, rows, u.more)
                })
                .collect();
            sent.sort();
            sent
        }
    }

    fn spec(start: &str, end: &str) -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(TableIdentifier::new("7", 1), RangeSpec::new(start, end))
    }

    fn plan() -> Arc<ReceiverPlan> {
        let mut plan = ReceiverPlan::new();
        plan.add("rs2", spec("", "m"), RangeState::steady());
        plan.add("rs3", spec("m", END_ROW_MARKER), RangeState::steady());
        Arc::new(plan)
    }

    fn limits(per_range: u64) -> BufferLimits {
        BufferLimits {
            per_range,
            aggregate: 1 << 30,
            channel_capacity: 2,
        }
    }

    fn buffer(sender: Arc<RecordingSender>, per_range: u64) -> ReplayBuffer {
        ReplayBuffer::new(
            "rs1",
            4,
            plan(),
            limits(per_range),
            RetryPolicy::linear(5, Duration::from_millis(1)),
            sender,
        )
    }

    fn kv(row: &str) -> KeyValue {
        KeyValue::new(row, "cf", 1, 1, b"v".to_vec())
    }

    fn rows(rows: &[&str]) -> Vec<String> {
        rows.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_fragment_change_closes_every_plan_range() {
        let sender = Arc::new(RecordingSender::default());
        let mut buf = buffer(sender.clone(), 1 << 20);
        assert!(buf.add(3, "7", kv("a")).unwrap());
        assert!(buf.add(3, "7", kv("b")).unwrap());
        assert!(buf.add(4, "7", kv("z")).unwrap());
        let stats = buf.finish().unwrap();

        assert_eq!(
            sender.sent(),
            vec![
                ("rs2".to_string(), 3, rows(&["a", "b"]), false),
                ("rs2".to_string(), 4, rows(&[]), false),
                ("rs3".to_string(), 3, rows(&[]), false),
                ("rs3".to_string(), 4, rows(&["z"]), false),
            ]
        );
        assert_eq!(stats.batches_sent, 4);
        assert_eq!(stats.pairs_sent, 3);
    }

    #[test]
    fn test_range_limit_sends_partial_batches() {
        let sender = Arc::new(RecordingSender::default());
        let one_pair = kv("a").encoded_len() as u64;
        let mut buf = buffer(sender.clone(), one_pair * 2);
        for row in ["a", "b", "c"] {
            buf.add(0, "7", kv(row)).unwrap();
        }
        buf.finish().unwrap();

        let to_rs2: Vec<_> = sender
            .updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(dest, _)| dest == "rs2")
            .map(|(_, u)| (u.pairs.len(), u.more))
            .collect();
        assert_eq!(to_rs2, vec![(2, true), (1, false)]);
    }

    #[test]
    fn test_unplanned_pairs_skipped() {
        let sender = Arc::new(RecordingSender::default());
        let mut buf = buffer(sender.clone(), 1 << 20);
        assert!(!buf.add(0, "99", kv("a")).unwrap());
        let stats = buf.finish().unwrap();
        assert_eq!(stats.pairs_sent, 0);
        // Both plan ranges still learn fragment 0 is complete
        assert_eq!(stats.batches_sent, 2);
    }

    #[test]
    fn test_empty_fragments_still_closed() {
        let sender = Arc::new(RecordingSender::default());
        let mut buf = buffer(sender.clone(), 1 << 20);
        buf.add(3, "7", kv("a")).unwrap();
        buf.close_fragments(&[3, 4]).unwrap();
        buf.finish().unwrap();

        assert_eq!(
            sender.sent(),
            vec![
                ("rs2".to_string(), 3, rows(&["a"]), false),
                ("rs2".to_string(), 4, rows(&[]), false),
                ("rs3".to_string(), 3, rows(&[]), false),
                ("rs3".to_string(), 4, rows(&[]), false),
            ]
        );
    }

    #[test]
    fn test_transient_failures_retried() {
        let sender = Arc::new(RecordingSender {
            transient_failures: AtomicU64::new(2),
            ..RecordingSender::default()
        });
        let mut buf = buffer(sender.clone(), 1 << 20);
        buf.add(0, "7", kv("a")).unwrap();
        let stats = buf.finish().unwrap();
        assert_eq!(stats.batches_sent, 2);
    }

    #[test]
    fn test_generation_mismatch_aborts() {
        let mismatch = FailoverError::PlanGenerationMismatch {
            location: "rs1".into(),
            staged: 5,
            requested: 4,
        };
        let sender = Arc::new(RecordingSender {
            reject_with: Some(mismatch.clone()),
            ..RecordingSender::default()
        });
        let mut buf = buffer(sender, 1 << 20);
        buf.add(0, "7", kv("a")).unwrap();
        assert_eq!(buf.finish().unwrap_err(), mismatch);
    }

    #[test]
    fn test_corrupt_first_block_still_closes_previous_fragment() {
        let sender = Arc::new(RecordingSender::default());
        let mut buf = buffer(sender.clone(), 1 << 20);
        buf.add(3, "7", kv("a")).unwrap();
        buf.fail_fragment(4).unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, fragment, _, more)| *fragment == 3 && !more));
    }

    #[test]
    fn test_corrupt_mid_fragment_drops_its_pairs() {
        let sender = Arc::new(RecordingSender::default());
        let mut buf = buffer(sender.clone(), 1 << 20);
        buf.add(4, "7", kv("a")).unwrap();
        buf.fail_fragment(4).unwrap();
        assert!(sender.sent().is_empty());
    }
}
