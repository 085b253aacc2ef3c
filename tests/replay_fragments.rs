//! Fragment Replay Tests
//!
//! A survivor scans fragments of a failed node's log and ships every pair
//! to the range's new owner:
//! - fragments may be split across several replaying nodes
//! - a corrupt fragment stops the replay unless skipping is configured,
//!   and what was delivered before it stays delivered
//! - the scan is bounded by its deadline and reports progress

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{corrupt_fragment, load_plan, split_user_table, two_way_plan, Cluster, TestNode};
use rangekeeper::failover::{FailoverError, ReceiverPlan, ReplayOutcome};
use rangekeeper::range::{RangeState, TableClass};

// =============================================================================
// Test Utilities
// =============================================================================

const FAILED: &str = "rs1";

fn replay(
    node: &TestNode,
    fragments: &[u32],
    plan: &ReceiverPlan,
    timeout: Duration,
) -> Result<ReplayOutcome, FailoverError> {
    node.coordinator.run_replay(
        1,
        FAILED,
        1,
        TableClass::User,
        fragments,
        Arc::new(plan.clone()),
        timeout,
    )
}

fn prepare_all(nodes: &[&TestNode], plan: &ReceiverPlan) {
    for node in nodes {
        let report = node
            .coordinator
            .prepare_ranges(1, FAILED, 1, &plan.specs_for(node.location()));
        assert!(report.is_success(), "prepare failed: {:?}", report.first_error());
    }
}

fn staged_rows(node: &TestNode) -> Vec<String> {
    let map = node.coordinator.phantom_map(FAILED).expect("staging map");
    let state = map.lock();
    let mut found: Vec<_> = state
        .ranges()
        .flat_map(|p| p.buffered_pairs().iter().map(|kv| kv.row().to_string()))
        .collect();
    found.sort();
    found
}

fn rows(rows: &[&str]) -> Vec<String> {
    rows.iter().map(|r| r.to_string()).collect()
}

/// rs1 wrote one block into each of fragments 0..=5.
fn six_fragment_log(cluster: &Cluster) -> std::path::PathBuf {
    cluster.write_log(FAILED, &[&["a"], &["b"], &["x"], &["c"], &["d", "e"], &["f"]])
}

// =============================================================================
// Distribution
// =============================================================================

/// Two survivors replay disjoint fragments into the same staged ranges.
#[test]
fn test_fragments_split_across_survivors() {
    let cluster = Cluster::new();
    cluster.write_log(FAILED, &[&["a", "n"], &["b", "z"]]);
    let rs2 = cluster.start("rs2");
    let rs3 = cluster.start("rs3");
    let plan = two_way_plan("rs2", "rs3");
    load_plan(&[&rs2, &rs3], FAILED, 1, &[0, 1], &plan);

    let first = replay(&rs2, &[0], &plan, Duration::from_secs(30)).unwrap();
    let second = replay(&rs3, &[1], &plan, Duration::from_secs(30)).unwrap();
    assert_eq!(first.pairs_sent + second.pairs_sent, 4);

    prepare_all(&[&rs2, &rs3], &plan);
    let (low, high) = split_user_table();
    let map = rs2.coordinator.phantom_map(FAILED).unwrap();
    let low_cells = map.lock().get(&low).unwrap().range().unwrap().cell_count();
    assert_eq!(low_cells, 2);
    let map = rs3.coordinator.phantom_map(FAILED).unwrap();
    let high_cells = map.lock().get(&high).unwrap().range().unwrap().cell_count();
    assert_eq!(high_cells, 2);
}

/// Rows no plan range covers are counted and dropped.
#[test]
fn test_rows_outside_plan_skipped() {
    let cluster = Cluster::new();
    cluster.write_log(FAILED, &[&["a", "n"], &["b", "z"]]);
    let rs2 = cluster.start("rs2");
    let (low, _) = split_user_table();
    let mut plan = ReceiverPlan::new();
    plan.add("rs2", low, RangeState::steady());
    load_plan(&[&rs2], FAILED, 1, &[0, 1], &plan);

    let outcome = replay(&rs2, &[0, 1], &plan, Duration::from_secs(30)).unwrap();
    assert_eq!(outcome.pairs_sent, 2);
    assert_eq!(outcome.pairs_skipped, 2);
    assert_eq!(staged_rows(&rs2), rows(&["a", "b"]));
}

/// Assigned fragments without data still complete on the receivers.
#[test]
fn test_fragment_without_rows_completes() {
    let cluster = Cluster::new();
    six_fragment_log(&cluster);
    let rs2 = cluster.start("rs2");
    let rs3 = cluster.start("rs3");
    let plan = two_way_plan("rs2", "rs3");
    // Fragment 6 is the empty one left by the final roll
    load_plan(&[&rs2, &rs3], FAILED, 1, &[5, 6], &plan);

    replay(&rs2, &[5, 6], &plan, Duration::from_secs(30)).unwrap();
    prepare_all(&[&rs2, &rs3], &plan);
}

// =============================================================================
// Corruption
// =============================================================================

/// Corruption in fragment 4 stops the scan with a fatal error naming it;
/// fragment 3 stays delivered.
#[test]
fn test_corrupt_fragment_aborts_replay() {
    let cluster = Cluster::new();
    let dir = six_fragment_log(&cluster);
    corrupt_fragment(&dir, 4);
    let rs2 = cluster.start("rs2");
    let rs3 = cluster.start("rs3");
    let plan = two_way_plan("rs2", "rs3");
    load_plan(&[&rs2, &rs3], FAILED, 1, &[3, 4, 5], &plan);

    let err = replay(&rs2, &[3, 4, 5], &plan, Duration::from_secs(30)).unwrap_err();
    assert!(matches!(err, FailoverError::CorruptFragment { fragment_id: 4, .. }));
    assert!(err.is_fatal());

    assert_eq!(staged_rows(&rs2), rows(&["c"]));
    let (low, _) = split_user_table();
    let map = rs2.coordinator.phantom_map(FAILED).unwrap();
    assert_eq!(map.lock().get(&low).unwrap().missing_fragments(), vec![4, 5]);
}

/// With skipping configured the corrupt fragment counts as empty and the
/// failover completes with everything else.
#[test]
fn test_corrupt_fragment_skipped_when_configured() {
    let cluster = Cluster::new();
    let dir = six_fragment_log(&cluster);
    corrupt_fragment(&dir, 4);
    let mut config = cluster.config("rs2");
    config.skip_corrupt_fragments = true;
    let rs2 = cluster.start_with(config);
    let rs3 = cluster.start("rs3");
    let plan = two_way_plan("rs2", "rs3");
    load_plan(&[&rs2, &rs3], FAILED, 1, &[3, 4, 5], &plan);

    let outcome = replay(&rs2, &[3, 4, 5], &plan, Duration::from_secs(30)).unwrap();
    assert_eq!(outcome.skipped_fragments, vec![4]);
    assert_eq!(staged_rows(&rs2), rows(&["c", "f"]));
    prepare_all(&[&rs2, &rs3], &plan);
    assert_eq!(rs2.ctx().metrics.snapshot().corrupt_fragments_skipped, 1);
}

/// The master hears about an aborted replay through its completion report.
#[tokio::test]
async fn test_aborted_replay_reported_to_master() {
    let cluster = Cluster::new();
    let dir = six_fragment_log(&cluster);
    corrupt_fragment(&dir, 4);
    let rs2 = cluster.start("rs2");
    let rs3 = cluster.start("rs3");
    let plan = two_way_plan("rs2", "rs3");
    load_plan(&[&rs2, &rs3], FAILED, 1, &[3, 4, 5], &plan);

    let report = rs2
        .coordinator
        .replay_fragments(
            9,
            FAILED.to_string(),
            1,
            TableClass::User,
            vec![3, 4, 5],
            plan,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    assert_eq!(
        report.result.as_ref().unwrap_err().code(),
        "RK_FAILOVER_CORRUPT_FRAGMENT"
    );
    let replays = cluster.master.replays.lock().unwrap();
    assert_eq!(replays.len(), 1);
    assert_eq!(replays[0].op_id, 9);
    assert_eq!(replays[0].fragments, vec![3, 4, 5]);
}

// =============================================================================
// Deadline and progress
// =============================================================================

/// A scan past its deadline stops with a retryable timeout.
#[test]
fn test_replay_deadline() {
    let cluster = Cluster::new();
    six_fragment_log(&cluster);
    let rs2 = cluster.start("rs2");
    let rs3 = cluster.start("rs3");
    let plan = two_way_plan("rs2", "rs3");
    load_plan(&[&rs2, &rs3], FAILED, 1, &[0, 1, 2], &plan);

    let err = replay(&rs2, &[0, 1, 2], &plan, Duration::ZERO).unwrap_err();
    assert!(matches!(err, FailoverError::Timeout { .. }));
    assert!(err.is_retryable());
}

/// Progress is reported to the master while the scan runs.
#[test]
fn test_replay_reports_progress() {
    let cluster = Cluster::new();
    six_fragment_log(&cluster);
    let mut config = cluster.config("rs2");
    config.replay_status_interval_ms = 0;
    let rs2 = cluster.start_with(config);
    let rs3 = cluster.start("rs3");
    let plan = two_way_plan("rs2", "rs3");
    load_plan(&[&rs2, &rs3], FAILED, 1, &[0, 1, 2], &plan);

    let outcome = replay(&rs2, &[0, 1, 2], &plan, Duration::from_secs(30)).unwrap();
    assert_eq!(outcome.blocks_read, 3);

    let statuses = cluster.master.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|(_, location, _)| location == FAILED));
    assert_eq!(statuses.last().unwrap().2.blocks_read, 3);
    assert_eq!(statuses.last().unwrap().2.current_fragment, Some(2));
}
