// Bounded parallel fan-out for batch scoring
//
// At most `width` oracle calls are in flight. Results are merged in
// completion order, not submission order.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Mutex;

use super::{FrameScorer, ScoreFailure, ScoreOutcome};

pub struct PooledScorer<S> {
    inner: S,
    width: usize,
}

impl<S: FrameScorer + Sync> PooledScorer<S> {
    pub fn new(inner: S, width: usize) -> Self {
        Self {
            inner,
            width: width.max(1),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

impl<S: FrameScorer + Sync> FrameScorer for PooledScorer<S> {
    fn score_frame(&self, index: usize) -> ScoreOutcome {
        self.inner.score_frame(index)
    }

    fn score_frames(&self, indices: &[usize]) -> Vec<(usize, ScoreOutcome)> {
        if indices.len() <= 1 || self.width == 1 {
            return self.inner.score_frames(indices);
        }

        let queue = Mutex::new(indices.iter().copied().collect::<VecDeque<usize>>());
        let (tx, rx) = mpsc::channel::<(usize, ScoreOutcome)>();
        let workers = self.width.min(indices.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let inner = &self.inner;
                scope.spawn(move || loop {
                    let next = {
                        let mut q = queue.lock().unwrap_or_else(|e| e.into_inner());
                        q.pop_front()
                    };
                    let Some(index) = next else {
                        break;
                    };
                    let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        inner.score_frame(index)
                    })) {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ScoreFailure::Provider("scorer panicked".to_string())),
                    };
                    if tx.send((index, outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            rx.iter().collect()
        })
    }
}
