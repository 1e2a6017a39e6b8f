use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::worker::{self, WorkerEnds};
use crate::{
    ClassificationResult, ClassifierKind, ConfigError, DispatchOutcome, Dispatcher, WorkItem,
    Worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Constructed, workers not launched yet.
    Created,
    /// Running with no accepted window awaiting collection.
    Idle,
    /// Running with at least one accepted window not collected yet.
    Busy,
    Stopped,
}

/// Counters since construction. Every dispatch attempt is either accepted or
/// dropped; every accepted window is eventually collected, lost to a failed
/// worker, lost at shutdown, or still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub attempts: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub collected: u64,
    /// Accepted windows discarded when their worker was replaced.
    pub lost: u64,
    pub restarts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopped,
}

/// Caller-side ends of one slot's single-item mailboxes.
struct Mailbox {
    input: Sender<WorkItem>,
    output: Receiver<ClassificationResult>,
}

fn mailboxes() -> (Mailbox, WorkerEnds) {
    let (input, worker_input) = bounded(1);
    let (worker_output, output) = bounded(1);
    (
        Mailbox { input, output },
        WorkerEnds {
            input: worker_input,
            output: worker_output,
        },
    )
}

struct Slot {
    index: usize,
    mailbox: Option<Mailbox>,
    // Worker ends waiting for start().
    pending: Option<WorkerEnds>,
    thread: Option<thread::JoinHandle<()>>,
    // Finished results recovered from a replaced worker's mailbox.
    held: VecDeque<ClassificationResult>,
    fed: bool,
    outstanding: u64,
}

impl Slot {
    fn new(index: usize) -> Self {
        let (mailbox, ends) = mailboxes();
        Self {
            index,
            mailbox: Some(mailbox),
            pending: Some(ends),
            thread: None,
            held: VecDeque::new(),
            fed: false,
            outstanding: 0,
        }
    }

    fn input_empty(&self) -> bool {
        self.mailbox.as_ref().is_some_and(|m| m.input.is_empty())
    }

    fn output_full(&self) -> bool {
        self.mailbox.as_ref().is_some_and(|m| m.output.is_full())
    }

    fn has_result(&self) -> bool {
        !self.held.is_empty() || self.output_full()
    }

    fn take_result(&mut self) -> Option<ClassificationResult> {
        if let Some(result) = self.held.pop_front() {
            return Some(result);
        }
        let m = self.mailbox.as_ref()?;
        if !m.output.is_full() {
            return None;
        }
        m.output.try_recv().ok()
    }

    fn offer(&self, item: WorkItem) -> Result<(), WorkItem> {
        let Some(m) = &self.mailbox else {
            return Err(item);
        };
        m.input.try_send(item).map_err(TrySendError::into_inner)
    }

    fn is_dead(&self) -> bool {
        match &self.thread {
            Some(t) => t.is_finished(),
            // a replacement that failed to spawn
            None => self.mailbox.is_none() && self.pending.is_none(),
        }
    }
}

#[derive(Clone, Copy)]
enum Rule {
    WarmUp,
    SteadyState,
}

/// WorkerPool runs a fixed set of classification workers, each behind a
/// single-item input mailbox and a single-item output mailbox.
///
/// Neither [`dispatch`](Self::dispatch) nor [`collect`](Self::collect) ever
/// blocks. A window that finds no eligible worker is dropped; the pool never
/// queues beyond its mailboxes. Results come back in slot order, not in the
/// order their windows were dispatched.
pub struct WorkerPool {
    slots: Vec<Slot>,
    worker: Worker,
    shutdown: Arc<AtomicBool>,
    state: State,
    stats: PoolStats,
}

impl WorkerPool {
    pub fn new(size: usize, worker: Worker) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::invalid("pool size", "need at least one worker"));
        }

        Ok(Self {
            slots: (0..size).map(Slot::new).collect(),
            worker,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: State::Created,
            stats: PoolStats::default(),
        })
    }

    /// Launches every worker thread.
    pub fn start(&mut self) -> Result<(), ConfigError> {
        match self.state {
            State::Running => return Ok(()),
            State::Stopped => return Err(ConfigError::Stopped),
            State::Created => {}
        }

        for slot in self.slots.iter_mut() {
            if let Some(ends) = slot.pending.take() {
                let handle =
                    worker::spawn(slot.index, self.worker.clone(), self.shutdown.clone(), ends)
                        .map_err(|source| ConfigError::Spawn {
                            slot: slot.index,
                            source,
                        })?;
                slot.thread = Some(handle);
            }
        }
        self.state = State::Running;
        log::info!("started {} classification workers", self.slots.len());
        Ok(())
    }

    /// Closes every mailbox and abandons the worker threads. Results not yet
    /// collected are lost; a worker busy classifying finishes that window and
    /// then exits.
    pub fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);

        let mut in_flight = 0;
        for slot in self.slots.iter_mut() {
            in_flight += slot.outstanding;
            slot.mailbox = None;
            slot.pending = None;
            slot.held.clear();
            // Detached, not joined: a stalled classifier must not hang shutdown.
            slot.thread = None;
        }
        self.state = State::Stopped;
        log::info!(
            "stopped classification workers, {} windows discarded ({:?})",
            in_flight,
            self.stats
        );
    }

    /// Hands a window to at most one worker.
    ///
    /// The first never-fed slot gets it (warm-up). Once every slot has been
    /// fed, the first slot with an empty input and a full output gets it
    /// (steady state). Otherwise the window is discarded.
    pub fn dispatch(&mut self, item: WorkItem) -> DispatchOutcome {
        self.stats.attempts += 1;
        if self.state == State::Running {
            self.revive_dead_slots();
        }

        let id = item.id;
        let outcome = self.assign(item);
        match outcome {
            DispatchOutcome::WarmUp(slot) => {
                self.stats.accepted += 1;
                log::debug!("first input to worker {slot}, window {id}");
            }
            DispatchOutcome::SteadyState(slot) => {
                self.stats.accepted += 1;
                log::debug!("input to worker {slot}, window {id}");
            }
            DispatchOutcome::Dropped => {
                self.stats.dropped += 1;
                log::trace!("no idle worker, dropping window {id}");
            }
        }
        outcome
    }

    fn assign(&mut self, mut item: WorkItem) -> DispatchOutcome {
        for rule in [Rule::WarmUp, Rule::SteadyState] {
            for slot in self.slots.iter_mut() {
                let eligible = match rule {
                    Rule::WarmUp => !slot.fed && slot.input_empty(),
                    Rule::SteadyState => slot.input_empty() && slot.output_full(),
                };
                if !eligible {
                    continue;
                }

                match slot.offer(item) {
                    Ok(()) => {
                        slot.fed = true;
                        slot.outstanding += 1;
                        return match rule {
                            Rule::WarmUp => DispatchOutcome::WarmUp(slot.index),
                            Rule::SteadyState => DispatchOutcome::SteadyState(slot.index),
                        };
                    }
                    Err(back) => item = back,
                }
            }
        }
        DispatchOutcome::Dropped
    }

    /// Takes the result of the first slot, in slot order, that has one
    /// waiting. Returns `None` when no result is ready.
    pub fn collect(&mut self) -> Option<ClassificationResult> {
        for slot in self.slots.iter_mut() {
            if let Some(result) = slot.take_result() {
                slot.outstanding = slot.outstanding.saturating_sub(1);
                self.stats.collected += 1;
                log::debug!("output from worker {}, window {}", slot.index, result.id);
                return Some(result);
            }
        }
        None
    }

    /// Replaces workers whose thread has exited. A replaced slot gets fresh
    /// mailboxes and rejoins through the warm-up rule. A result the worker
    /// finished before exiting is kept for [`collect`](Self::collect); the
    /// window it failed on is lost. Returns the number of slots replaced.
    pub fn revive_dead_slots(&mut self) -> usize {
        if self.state != State::Running {
            return 0;
        }

        let mut revived = 0;
        for slot in self.slots.iter_mut() {
            if !slot.is_dead() {
                continue;
            }
            if let Some(dead) = slot.thread.take() {
                if dead.join().is_err() {
                    log::error!("worker {} panicked", slot.index);
                }
            }

            // Buffered messages outlive the worker's sender.
            if let Some(old) = slot.mailbox.take() {
                slot.held.extend(old.output.try_recv());
            }
            let held = slot.held.len() as u64;
            let lost = slot.outstanding.saturating_sub(held);
            if lost > 0 {
                log::warn!("worker {} is gone, {} windows lost", slot.index, lost);
            }
            self.stats.lost += lost;
            slot.outstanding = held;
            slot.fed = false;

            let (mailbox, ends) = mailboxes();
            match worker::spawn(slot.index, self.worker.clone(), self.shutdown.clone(), ends) {
                Ok(handle) => {
                    log::warn!("replaced dead worker {}", slot.index);
                    self.stats.restarts += 1;
                    slot.thread = Some(handle);
                    slot.mailbox = Some(mailbox);
                    revived += 1;
                }
                Err(e) => {
                    // Out of rotation; retried on the next dispatch.
                    log::error!("failed to replace worker {}: {e}", slot.index);
                }
            }
        }
        revived
    }

    pub fn status(&self) -> PoolStatus {
        match self.state {
            State::Created => PoolStatus::Created,
            State::Stopped => PoolStatus::Stopped,
            State::Running if self.slots.iter().any(|s| s.outstanding > 0) => PoolStatus::Busy,
            State::Running => PoolStatus::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    /// Number of slots holding a result that has not been collected.
    pub fn ready(&self) -> usize {
        self.slots.iter().filter(|s| s.has_result()).count()
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn kind(&self) -> ClassifierKind {
        self.worker.kind()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

impl Dispatcher for WorkerPool {
    fn dispatch(&mut self, item: WorkItem) -> DispatchOutcome {
        WorkerPool::dispatch(self, item)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Classifier, FeatureId, Flatten, Prediction, TimeWindow};
    use anyhow::{bail, Result};
    use std::time::{Duration, Instant};
    use tract_onnx::prelude::tract_ndarray::Array2;

    /// Returns the first feature as the probability.
    struct Echo;

    impl Classifier for Echo {
        fn kind(&self) -> ClassifierKind {
            ClassifierKind::Probability
        }

        fn predict(&self, features: &Array2<f32>) -> Result<Prediction> {
            if features[[0, 0]] < 0.0 {
                bail!("negative input");
            }
            Ok(Prediction::Probability(features[[0, 0]]))
        }
    }

    /// Holds every prediction until the gate opens.
    struct Gate(Receiver<()>);

    impl Classifier for Gate {
        fn kind(&self) -> ClassifierKind {
            ClassifierKind::Probability
        }

        fn predict(&self, features: &Array2<f32>) -> Result<Prediction> {
            let _ = self.0.recv();
            Ok(Prediction::Probability(features[[0, 0]]))
        }
    }

    fn item(id: u64, value: f32) -> WorkItem {
        let rows = vec![vec![value]];
        WorkItem {
            window: TimeWindow::from_rows(rows.iter(), 1),
            id: FeatureId(id),
        }
    }

    fn pool(size: usize, classifier: impl Classifier + 'static) -> WorkerPool {
        let worker = Worker::new(Arc::new(Flatten), Arc::new(classifier));
        let mut pool = WorkerPool::new(size, worker).unwrap();
        pool.start().unwrap();
        pool
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for workers");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn rejects_empty_pool() {
        let worker = Worker::new(Arc::new(Flatten), Arc::new(Echo));
        assert!(matches!(
            WorkerPool::new(0, worker),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn saturated_pool_drops_without_state_change() {
        let (open, gate) = bounded::<()>(0);
        let mut pool = pool(3, Gate(gate));

        for i in 0..3 {
            assert_eq!(
                pool.dispatch(item(i + 1, i as f32)),
                DispatchOutcome::WarmUp(i as usize)
            );
        }
        let before = pool.stats();
        assert_eq!(pool.dispatch(item(4, 4.0)), DispatchOutcome::Dropped);

        let after = pool.stats();
        assert_eq!(after.attempts, before.attempts + 1);
        assert_eq!(after.dropped, before.dropped + 1);
        assert_eq!(after.accepted, before.accepted);
        assert_eq!(pool.status(), PoolStatus::Busy);
        assert_eq!(pool.ready(), 0);

        drop(open);
        wait_until(|| pool.ready() == 3);
        let ids: Vec<_> = std::iter::from_fn(|| pool.collect()).map(|r| r.id).collect();
        assert_eq!(ids, vec![FeatureId(1), FeatureId(2), FeatureId(3)]);
        assert_eq!(pool.status(), PoolStatus::Idle);
    }

    #[test]
    fn empty_collect_is_idempotent() {
        let mut pool = pool(2, Echo);
        for _ in 0..3 {
            assert!(pool.collect().is_none());
        }
        assert_eq!(pool.stats(), PoolStats::default());
        assert_eq!(pool.status(), PoolStatus::Idle);
    }

    #[test]
    fn collect_returns_each_result_once() {
        let mut pool = pool(1, Echo);
        pool.dispatch(item(1, 0.5));
        wait_until(|| pool.ready() == 1);

        let first = pool.collect().unwrap();
        assert_eq!(first.prediction, Prediction::Probability(0.5));
        assert_eq!(first.slot, 0);
        assert!(pool.collect().is_none());
        assert_eq!(pool.stats().collected, 1);
    }

    #[test]
    fn steady_state_requires_uncollected_output() {
        let mut pool = pool(1, Echo);
        assert_eq!(pool.dispatch(item(1, 0.1)), DispatchOutcome::WarmUp(0));
        wait_until(|| pool.ready() == 1);

        assert_eq!(pool.dispatch(item(2, 0.2)), DispatchOutcome::SteadyState(0));
        assert_eq!(pool.collect().unwrap().id, FeatureId(1));
        wait_until(|| pool.ready() == 1);

        assert_eq!(pool.collect().unwrap().id, FeatureId(2));
        // fed, output just drained: not eligible until the next result lands
        assert_eq!(pool.dispatch(item(3, 0.3)), DispatchOutcome::Dropped);
    }

    #[test]
    fn dead_worker_is_replaced() {
        let mut pool = pool(1, Echo);
        assert_eq!(pool.dispatch(item(1, -1.0)), DispatchOutcome::WarmUp(0));
        wait_until(|| pool.revive_dead_slots() == 1);

        let stats = pool.stats();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.lost, 1);

        // the replacement rejoins through warm-up
        assert_eq!(pool.dispatch(item(2, 0.7)), DispatchOutcome::WarmUp(0));
        wait_until(|| pool.ready() == 1);
        assert_eq!(pool.collect().unwrap().id, FeatureId(2));
    }

    #[test]
    fn replacement_keeps_finished_result() {
        let mut pool = pool(1, Echo);
        assert_eq!(pool.dispatch(item(1, 0.5)), DispatchOutcome::WarmUp(0));
        wait_until(|| pool.ready() == 1);

        // accepted while result 1 waits, then fails
        assert_eq!(pool.dispatch(item(2, -1.0)), DispatchOutcome::SteadyState(0));
        wait_until(|| pool.slots[0].is_dead());

        assert_eq!(pool.dispatch(item(3, 0.3)), DispatchOutcome::WarmUp(0));
        let stats = pool.stats();
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.restarts, 1);

        assert_eq!(pool.collect().unwrap().id, FeatureId(1));
        wait_until(|| pool.ready() == 1);
        assert_eq!(pool.collect().unwrap().id, FeatureId(3));
        assert_eq!(pool.stats().collected, 2);
        assert_eq!(pool.status(), PoolStatus::Idle);
    }

    #[test]
    fn stop_discards_results() {
        let mut pool = pool(2, Echo);
        pool.dispatch(item(1, 0.5));
        wait_until(|| pool.ready() == 1);

        pool.stop();
        assert_eq!(pool.status(), PoolStatus::Stopped);
        assert!(pool.collect().is_none());
        assert_eq!(pool.dispatch(item(2, 0.5)), DispatchOutcome::Dropped);
        assert!(matches!(pool.start(), Err(ConfigError::Stopped)));
    }

    #[test]
    fn windows_wait_in_mailboxes_before_start() {
        let worker = Worker::new(Arc::new(Flatten), Arc::new(Echo));
        let mut pool = WorkerPool::new(1, worker).unwrap();
        assert_eq!(pool.status(), PoolStatus::Created);
        assert_eq!(pool.dispatch(item(1, 0.4)), DispatchOutcome::WarmUp(0));

        pool.start().unwrap();
        wait_until(|| pool.ready() == 1);
        assert_eq!(pool.collect().unwrap().id, FeatureId(1));
    }
}
