use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use circular_buffer::CircularBuffer;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use crate::{Classifier, ClassifierKind, FeatureId, FeatureTransform, Prediction, WorkItem};

/// Number of recent windows the latency report averages over.
pub const LATENCY_HISTORY: usize = 32;

/// The output of one worker for one accepted window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub id: FeatureId,
    pub prediction: Prediction,
    /// Index of the slot that produced the result.
    pub slot: usize,
    pub extract_time: Duration,
    pub predict_time: Duration,
}

impl ClassificationResult {
    /// Feature extraction plus classification.
    pub fn elapsed(&self) -> Duration {
        self.extract_time + self.predict_time
    }
}

/// Feature extraction and classification as one step.
#[derive(Clone)]
pub struct Worker {
    transform: Arc<dyn FeatureTransform>,
    classifier: Arc<dyn Classifier>,
}

impl Worker {
    pub fn new(transform: Arc<dyn FeatureTransform>, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            transform,
            classifier,
        }
    }

    pub fn kind(&self) -> ClassifierKind {
        self.classifier.kind()
    }

    pub fn process(&self, slot: usize, item: WorkItem) -> Result<ClassificationResult> {
        let started = Instant::now();
        let features = self.transform.extract(&item.window)?;
        let extract_time = started.elapsed();

        let started = Instant::now();
        let prediction = self.classifier.predict(&features)?;

        Ok(ClassificationResult {
            id: item.id,
            prediction,
            slot,
            extract_time,
            predict_time: started.elapsed(),
        })
    }
}

/// Rolling record of recent processing times.
struct Latency(CircularBuffer<LATENCY_HISTORY, Duration>);

impl Latency {
    fn new() -> Self {
        Self(CircularBuffer::new())
    }

    fn record(&mut self, d: Duration) {
        self.0.push_back(d);
    }

    fn mean(&self) -> Duration {
        if self.0.is_empty() {
            return Duration::ZERO;
        }
        self.0.iter().sum::<Duration>() / self.0.len() as u32
    }
}

/// The caller-facing ends handed to the worker thread.
pub(crate) struct WorkerEnds {
    pub input: Receiver<WorkItem>,
    pub output: Sender<ClassificationResult>,
}

pub(crate) fn spawn(
    slot: usize,
    worker: Worker,
    shutdown: Arc<AtomicBool>,
    ends: WorkerEnds,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("classifier-{slot}"))
        .spawn(move || {
            if let Err(e) = mainloop(slot, worker, shutdown, ends) {
                log::error!("worker {slot} failed, shutting down: {e:#}");
            }
        })
}

fn mainloop(
    slot: usize,
    worker: Worker,
    shutdown: Arc<AtomicBool>,
    ends: WorkerEnds,
) -> Result<()> {
    let WorkerEnds { input, output } = ends;
    let mut latency = Latency::new();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        let item = match input.recv() {
            Ok(item) => item,
            Err(_e) => return Ok(()),
        };
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        let result = worker.process(slot, item)?;
        latency.record(result.elapsed());
        log::debug!(
            "worker {slot}: window {} features {:.2?}, classifier {:.2?} (mean total {:.2?})",
            result.id,
            result.extract_time,
            result.predict_time,
            latency.mean()
        );

        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Blocks while the previous result is still uncollected.
        if output.send(result).is_err() {
            return Ok(());
        }
    }
}
