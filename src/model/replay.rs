//! Bounded replay buffer of resolved samples.

use parking_lot::Mutex;
use rand::seq::index;
use rand::Rng;
use std::collections::VecDeque;

use crate::types::ResolvedSample;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    #[error("insufficient data: requested {requested} samples, buffer holds {available}")]
    InsufficientData { requested: usize, available: usize },
}

/// FIFO ring of training samples. Size never exceeds capacity; once full the
/// oldest insertion is evicted regardless of how often it was sampled.
pub struct ReplayBuffer {
    capacity: usize,
    samples: Mutex<VecDeque<ResolvedSample>>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Insert, evicting the oldest sample when full
    pub fn add(&self, sample: ResolvedSample) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Draw `n` distinct samples uniformly at random
    pub fn sample(&self, n: usize) -> Result<Vec<ResolvedSample>, ReplayError> {
        self.sample_with(n, &mut rand::thread_rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<ResolvedSample>, ReplayError> {
        let samples = self.samples.lock();
        if n > samples.len() {
            return Err(ReplayError::InsufficientData {
                requested: n,
                available: samples.len(),
            });
        }

        Ok(index::sample(rng, samples.len(), n)
            .into_iter()
            .map(|i| samples[i].clone())
            .collect())
    }

    /// Contents in insertion order
    pub fn snapshot(&self) -> Vec<ResolvedSample> {
        self.samples.lock().iter().cloned().collect()
    }
}
