//! Soak loop: one writer inserting in a chosen order, readers snapshotting
//! concurrently, structural checks at every round boundary.

use crate::config::{InsertOrder, StressConfig};
use crate::error::{StressError, StressResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use resv_fence::{Fence, FenceRef, Timeline, context_alloc};
use resv_object::{FenceSnapshot, ReservationObject, ResvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of a stress run
#[derive(Debug, Clone, Default, Serialize)]
pub struct StressReport {
    /// Instance that produced the report
    pub service_name: String,
    /// Rounds completed
    pub rounds: u64,
    /// Shared fences inserted over all rounds
    pub inserts: u64,
    /// Insertion order used
    pub order: String,
    /// Reader threads
    pub readers: usize,
    /// Snapshots taken by readers
    pub snapshots: u64,
    /// Snapshots whose shared fences did not belong to their exclusive fence
    pub torn_snapshots: u64,
    /// Reservations refused with out-of-memory
    pub oom_failures: u64,
    /// Structural validations passed
    pub validations: u64,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

impl StressReport {
    /// True if no reader saw an inconsistent snapshot
    pub fn is_clean(&self) -> bool {
        self.torn_snapshots == 0
    }
}

/// Sequence numbers `1..=count` arranged in `order`
pub fn insertion_order(order: InsertOrder, count: u64, seed: u64) -> Vec<u64> {
    let mut seqnos: Vec<u64> = (1..=count).collect();
    match order {
        InsertOrder::Forward => {}
        InsertOrder::Backward => seqnos.reverse(),
        InsertOrder::Random => seqnos.shuffle(&mut StdRng::seed_from_u64(seed)),
    }
    seqnos
}

/// Context layout of a run: one exclusive context, one timeline per round
struct Contexts {
    excl: u64,
    timelines: Vec<Timeline>,
}

impl Contexts {
    fn timeline(&self, round: u64) -> StressResult<&Timeline> {
        usize::try_from(round)
            .ok()
            .and_then(|round| self.timelines.get(round))
            .ok_or(StressError::Internal("round outside context table"))
    }

    fn new(rounds: u64) -> Self {
        Self {
            excl: context_alloc(1),
            timelines: (0..rounds)
                .map(|round| Timeline::new(format!("round-{round}")))
                .collect(),
        }
    }

    /// A snapshot is consistent when every shared fence comes from the
    /// timeline of the round its exclusive fence opened.
    fn is_consistent(&self, snapshot: &FenceSnapshot) -> bool {
        let Some(excl) = &snapshot.exclusive else {
            return snapshot.shared.is_empty();
        };
        if excl.context() != self.excl {
            return false;
        }
        let Ok(timeline) = self.timeline(excl.seqno()) else {
            return false;
        };
        snapshot
            .shared
            .iter()
            .all(|fence| fence.context() == timeline.context())
    }
}

#[derive(Default)]
struct ReaderStats {
    snapshots: AtomicU64,
    torn: AtomicU64,
}

fn reader_loop(
    resv: &ReservationObject,
    contexts: &Contexts,
    stop: &AtomicBool,
    stats: &ReaderStats,
) {
    while !stop.load(Ordering::Acquire) {
        let snapshot = resv.get_fences();
        if !contexts.is_consistent(&snapshot) {
            warn!(
                exclusive = ?snapshot.exclusive,
                shared = snapshot.shared.len(),
                "torn fence snapshot"
            );
            stats.torn.fetch_add(1, Ordering::Relaxed);
        }
        stats.snapshots.fetch_add(1, Ordering::Relaxed);

        let _ = resv.test_signaled(true);
        let _ = resv.for_each_shared().count();
    }
}

/// Writer side of one round. Returns the fences inserted, in order.
fn run_round(
    resv: &ReservationObject,
    config: &StressConfig,
    contexts: &Contexts,
    round: u64,
    report: &mut StressReport,
) -> StressResult<Vec<FenceRef>> {
    let run = &config.run;
    let timeline = contexts.timeline(round)?;
    resv.lock().add_excl_fence(Some(Fence::signaled(contexts.excl, round)));

    let order = insertion_order(run.order, run.fences, run.seed.wrapping_add(round));
    let mut inserted = Vec::with_capacity(order.len());
    for (index, seqno) in order.into_iter().enumerate() {
        let mut guard = resv.lock();
        match guard.reserve_shared() {
            Ok(()) => {}
            Err(ResvError::OutOfMemory { bytes }) => {
                warn!(round, inserted = index, bytes, "round stopped: reservation refused");
                report.oom_failures += 1;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let fence = timeline.create_fence(seqno);
        guard.add_shared_fence(fence.clone());
        inserted.push(fence);

        let count = index as u64 + 1;
        if run.validate_every > 0 && count % run.validate_every == 0 {
            guard.validate()?;
            report.validations += 1;
        }
    }
    report.inserts += inserted.len() as u64;
    Ok(inserted)
}

/// Check a finished round, then complete its fences and wait for them.
fn finish_round(
    resv: &ReservationObject,
    config: &StressConfig,
    contexts: &Contexts,
    round: u64,
    inserted: &[FenceRef],
    report: &mut StressReport,
) -> StressResult<()> {
    resv.lock().validate()?;
    report.validations += 1;

    let seen: Vec<u64> = resv.for_each_shared().map(|f| f.seqno()).collect();
    let expected: Vec<u64> = inserted.iter().map(|f| f.seqno()).collect();
    if seen != expected {
        return Err(StressError::Mismatch {
            round,
            expected: expected.len(),
            found: seen.len(),
        });
    }

    contexts.timeline(round)?.signal(config.run.fences);
    let remaining = resv.wait_timeout(true, false, config.run.wait_timeout())?;
    debug!(
        round,
        fences = inserted.len(),
        remaining_ms = remaining.as_millis() as u64,
        "round complete"
    );
    Ok(())
}

/// Run the configured soak test
pub fn run_stress(config: &StressConfig) -> StressResult<StressReport> {
    config.validate()?;
    let resv = ReservationObject::with_config(config.reservation)?;
    let contexts = Contexts::new(config.run.rounds);
    let stop = AtomicBool::new(false);
    let stats = ReaderStats::default();

    let mut report = StressReport {
        service_name: config.shared.service_name.clone(),
        order: config.run.order.to_string(),
        readers: config.run.readers,
        ..StressReport::default()
    };

    info!(
        fences = config.run.fences,
        rounds = config.run.rounds,
        readers = config.run.readers,
        order = %config.run.order,
        "stress run starting"
    );
    let started = Instant::now();

    let outcome = thread::scope(|s| {
        for _ in 0..config.run.readers {
            s.spawn(|| reader_loop(&resv, &contexts, &stop, &stats));
        }

        let mut outcome = Ok(());
        for round in 0..config.run.rounds {
            outcome = run_round(&resv, config, &contexts, round, &mut report).and_then(
                |inserted| finish_round(&resv, config, &contexts, round, &inserted, &mut report),
            );
            if outcome.is_err() {
                break;
            }
            report.rounds += 1;
        }
        stop.store(true, Ordering::Release);
        outcome
    });
    outcome?;

    {
        let mut guard = resv.lock();
        guard.synchronize();
        guard.add_excl_fence(None);
    }

    report.snapshots = stats.snapshots.load(Ordering::Relaxed);
    report.torn_snapshots = stats.torn.load(Ordering::Relaxed);
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        inserts = report.inserts,
        snapshots = report.snapshots,
        torn = report.torn_snapshots,
        elapsed_ms = report.elapsed_ms,
        "stress run finished"
    );
    Ok(report)
}
