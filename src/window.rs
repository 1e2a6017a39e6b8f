use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;
use tract_onnx::prelude::tract_ndarray::{Array2, ArrayView1, ArrayView2};

use crate::{PoseTransform, SkeletonFrame};

/// Tags each dispatch attempt of one accumulator. Only used for tracing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct FeatureId(pub u64);

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A snapshot of the most recent frame rows, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow(Array2<f32>);

impl TimeWindow {
    /// Stacks equally sized rows. Panics if a row has the wrong width.
    pub fn from_rows<'a, I>(rows: I, width: usize) -> Self
    where
        I: IntoIterator<Item = &'a Vec<f32>>,
    {
        let mut data = Vec::new();
        let mut frames = 0;
        for row in rows {
            assert_eq!(row.len(), width, "time window row has the wrong width");
            data.extend_from_slice(row);
            frames += 1;
        }
        let array = Array2::from_shape_vec((frames, width), data)
            .expect("row count and width match the data length");
        Self(array)
    }

    pub fn frames(&self) -> usize {
        self.0.nrows()
    }

    pub fn width(&self) -> usize {
        self.0.ncols()
    }

    pub fn row(&self, idx: usize) -> ArrayView1<'_, f32> {
        self.0.row(idx)
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.0.view()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f32> {
        self.0.iter()
    }
}

/// A window handed to the pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub window: TimeWindow,
    pub id: FeatureId,
}

/// How the pool handled one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Assigned to a slot that had never been fed.
    WarmUp(usize),
    /// Assigned to a slot whose previous result is waiting to be collected.
    SteadyState(usize),
    /// No slot was eligible; the window was discarded.
    Dropped,
}

impl DispatchOutcome {
    pub fn slot(&self) -> Option<usize> {
        match self {
            Self::WarmUp(s) | Self::SteadyState(s) => Some(*s),
            Self::Dropped => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

/// Anything that accepts windows without blocking.
pub trait Dispatcher {
    fn dispatch(&mut self, item: WorkItem) -> DispatchOutcome;
}

/// TimeWindowAccumulator keeps the last `capacity` frame rows and offers a
/// snapshot for classification on every frame once it is full.
///
/// Windows are not dispatched once: after the buffer first fills, every new
/// frame evicts the oldest row and triggers another attempt, so consecutive
/// windows overlap by all but one frame.
#[derive(Debug)]
pub struct TimeWindowAccumulator {
    rows: VecDeque<Vec<f32>>,
    capacity: usize,
    pose: PoseTransform,
    next_id: u64,
}

impl TimeWindowAccumulator {
    pub fn new(capacity: usize, pose: PoseTransform) -> Self {
        assert!(capacity > 0, "time window needs at least one frame");
        Self {
            rows: VecDeque::with_capacity(capacity + 1),
            capacity,
            pose,
            next_id: 0,
        }
    }

    pub fn push<D: Dispatcher>(
        &mut self,
        frame: &SkeletonFrame,
        pool: &mut D,
    ) -> Option<(FeatureId, DispatchOutcome)> {
        self.rows.push_back(self.pose.apply(frame));
        while self.rows.len() > self.capacity {
            self.rows.pop_front();
        }

        if !self.is_full() {
            return None;
        }

        self.next_id += 1;
        let id = FeatureId(self.next_id);
        let window = TimeWindow::from_rows(self.rows.iter(), self.pose.width());
        Some((id, pool.dispatch(WorkItem { window, id })))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pose(&self) -> &PoseTransform {
        &self.pose
    }

    /// The id of the most recent dispatch attempt, zero before the first.
    pub fn last_id(&self) -> FeatureId {
        FeatureId(self.next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Point;

    #[derive(Default)]
    struct Recorder {
        items: Vec<WorkItem>,
    }

    impl Dispatcher for Recorder {
        fn dispatch(&mut self, item: WorkItem) -> DispatchOutcome {
            self.items.push(item);
            DispatchOutcome::WarmUp(0)
        }
    }

    fn frame(n: f32) -> SkeletonFrame {
        [("nose", Point::new(n, -n))].into_iter().collect()
    }

    #[test]
    fn dispatches_every_frame_once_full() {
        let mut acc = TimeWindowAccumulator::new(3, PoseTransform::new(2));
        let mut pool = Recorder::default();

        let outcomes: Vec<_> = (1..=5)
            .map(|n| acc.push(&frame(n as f32), &mut pool))
            .collect();

        assert!(outcomes[0].is_none());
        assert!(outcomes[1].is_none());
        assert_eq!(pool.items.len(), 3);

        let ids: Vec<_> = pool.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![FeatureId(1), FeatureId(2), FeatureId(3)]);

        // each window holds the three most recent frames, oldest first
        for (item, newest) in pool.items.iter().zip(3..=5) {
            assert_eq!(item.window.frames(), 3);
            let xs: Vec<f32> = (0..3).map(|r| item.window.row(r)[0]).collect();
            let n = newest as f32;
            assert_eq!(xs, vec![n - 2.0, n - 1.0, n]);
        }
        assert_eq!(acc.len(), 3);
        assert_eq!(acc.last_id(), FeatureId(3));
    }

    #[test]
    fn counts_attempts_even_when_dropped() {
        struct Full;
        impl Dispatcher for Full {
            fn dispatch(&mut self, _item: WorkItem) -> DispatchOutcome {
                DispatchOutcome::Dropped
            }
        }

        let mut acc = TimeWindowAccumulator::new(1, PoseTransform::new(2));
        let first = acc.push(&frame(1.0), &mut Full);
        let second = acc.push(&frame(2.0), &mut Full);
        assert_eq!(first, Some((FeatureId(1), DispatchOutcome::Dropped)));
        assert_eq!(second, Some((FeatureId(2), DispatchOutcome::Dropped)));
    }

    #[test]
    fn snapshot_is_independent_of_later_frames() {
        let mut acc = TimeWindowAccumulator::new(2, PoseTransform::new(2));
        let mut pool = Recorder::default();
        acc.push(&frame(1.0), &mut pool);
        acc.push(&frame(2.0), &mut pool);
        acc.push(&frame(3.0), &mut pool);

        assert_eq!(pool.items[0].window.row(0)[0], 1.0);
        assert_eq!(pool.items[1].window.row(0)[0], 2.0);
    }
}
