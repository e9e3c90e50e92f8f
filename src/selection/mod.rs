// Detection Summary - Adaptive Frame Selection
//
// Picks which captured frames to send to the scoring oracle under a hard
// budget, then returns the best one. Phases: seed probes, ternary-style peak
// search, trailing no-person cutoff, neighbor fill, seeded random fill.
// Best effort: the global optimum is not guaranteed.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Result, SummaryError};
use crate::scoring::ranking::{best_index, RankKey};
use crate::scoring::{FrameScorer, ScoreResult};

/// Inputs for one selection run.
#[derive(Debug, Clone)]
pub struct SelectionParams {
    pub total_frames: usize,
    pub budget: usize,
    pub seed: String,
    pub no_people_threshold: f64,
    pub lookahead_after_no_people: usize,
}

impl SelectionParams {
    pub fn new(total_frames: usize, budget: usize, seed: impl Into<String>) -> Result<Self> {
        if budget < 1 {
            return Err(SummaryError::Config("selection budget must be at least 1".to_string()));
        }
        Ok(Self {
            total_frames,
            budget,
            seed: seed.into(),
            no_people_threshold: DEFAULT_NO_PEOPLE_THRESHOLD,
            lookahead_after_no_people: DEFAULT_LOOKAHEAD_AFTER_NO_PEOPLE,
        })
    }

    pub fn with_no_people_threshold(mut self, threshold: f64) -> Self {
        self.no_people_threshold = threshold;
        self
    }

    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead_after_no_people = lookahead;
        self
    }
}

/// What the engine did, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionMeta {
    pub budget: usize,
    pub scored_indices: Vec<usize>,
    pub probe_order: Vec<usize>,
    pub cutoff_index_inclusive: usize,
    pub best_index: usize,
    /// True when no real score exists and index 0 holds an empty result
    #[serde(default)]
    pub placeholder: bool,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub scored: BTreeMap<usize, ScoreResult>,
    pub meta: SelectionMeta,
}

/// Stable 64-bit seed from a session id.
pub fn seed_from_str(seed: &str) -> u64 {
    let hash = blake3::hash(seed.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Run the adaptive search. Never fails: scoring errors only mean "no result
/// for that index", and an empty outcome degrades to a placeholder.
pub fn adaptive_select_and_score(params: &SelectionParams, scorer: &dyn FrameScorer) -> Selection {
    let mut engine = Engine::new(params, scorer);
    engine.run()
}

struct Engine<'a> {
    n: usize,
    budget: usize,
    threshold: f64,
    lookahead: usize,
    scorer: &'a dyn FrameScorer,
    rng: StdRng,
    scored: BTreeMap<usize, ScoreResult>,
    attempted: HashSet<usize>,
    probes: Vec<usize>,
}

impl<'a> Engine<'a> {
    fn new(params: &SelectionParams, scorer: &'a dyn FrameScorer) -> Self {
        Self {
            n: params.total_frames,
            budget: params.budget.max(1),
            threshold: params.no_people_threshold,
            lookahead: params.lookahead_after_no_people,
            scorer,
            rng: StdRng::seed_from_u64(seed_from_str(&params.seed)),
            scored: BTreeMap::new(),
            attempted: HashSet::new(),
            probes: Vec::new(),
        }
    }

    fn exhausted(&self) -> bool {
        self.scored.len() >= self.budget
    }

    fn clamp(&self, i: usize) -> usize {
        i.min(self.n - 1)
    }

    /// Score any not-yet-attempted indices, trimmed to the remaining budget.
    /// Failed indices stay out of `scored` and are never retried.
    fn ensure_batch(&mut self, indices: &[usize]) {
        if indices.is_empty() || self.exhausted() {
            return;
        }

        let mut uniq: Vec<usize> = Vec::new();
        for &raw in indices {
            let i = self.clamp(raw);
            if self.scored.contains_key(&i) || self.attempted.contains(&i) || uniq.contains(&i) {
                continue;
            }
            uniq.push(i);
        }
        uniq.truncate(self.budget - self.scored.len());
        if uniq.is_empty() {
            return;
        }

        self.probes.extend_from_slice(&uniq);
        self.attempted.extend(uniq.iter().copied());

        for (i, outcome) in self.scorer.score_frames(&uniq) {
            match outcome {
                Ok(res) => {
                    if !self.scored.contains_key(&i) && !self.exhausted() {
                        self.scored.insert(i, res);
                    }
                }
                Err(failure) => {
                    log::debug!("selection: index {} not scored: {}", i, failure);
                }
            }
        }
    }

    /// Result for one index, scoring it if budget allows. Missing results
    /// read as the placeholder.
    fn ensure(&mut self, raw: usize) -> ScoreResult {
        let i = self.clamp(raw);
        if let Some(res) = self.scored.get(&i) {
            return res.clone();
        }
        if self.exhausted() {
            return ScoreResult::placeholder();
        }
        self.ensure_batch(&[i]);
        self.scored.get(&i).cloned().unwrap_or_default()
    }

    fn no_person(&self, res: &ScoreResult) -> bool {
        res.person_score <= self.threshold
    }

    fn run(&mut self) -> Selection {
        if self.n == 0 {
            return self.finish(0);
        }

        if self.n <= self.budget {
            let all: Vec<usize> = (0..self.n).collect();
            self.ensure_batch(&all);
            return self.finish(self.n - 1);
        }

        self.seed_probes();
        if self.exhausted() {
            return self.finish(self.n - 1);
        }

        self.peak_search();
        let best = best_index(&self.scored).unwrap_or(0);
        let cutoff = self.find_cutoff(best);
        self.fill(best, cutoff);
        self.finish(cutoff)
    }

    /// First, middle, last, one early-biased draw and one jittered midpoint.
    fn seed_probes(&mut self) {
        let n = self.n;
        let mut seeds: BTreeSet<usize> = [0, n / 2, n - 1].into_iter().collect();

        if self.budget > 3 {
            let early_max = ((n - 1) as f64 * SEED_EARLY_FRACTION) as usize;
            let u: f64 = self.rng.gen();
            let idx = (u * u * u * early_max as f64) as usize;
            seeds.insert(idx.min(early_max));
        }

        if self.budget >= 4 {
            let span = (n / SEED_MIDPOINT_JITTER_DIVISOR).max(1) as i64;
            let jitter = self.rng.gen_range(-span..=span);
            let idx = (n as i64 / 2 + jitter).clamp(0, n as i64 - 1) as usize;
            seeds.insert(idx);
        }

        let seeds: Vec<usize> = seeds.into_iter().collect();
        self.ensure_batch(&seeds);
    }

    /// Narrow [lo, hi] toward the better third-point.
    fn peak_search(&mut self) {
        let mut lo = 0usize;
        let mut hi = self.n - 1;
        let iterations = (self.budget / 2).clamp(PEAK_SEARCH_MIN_ITERATIONS, PEAK_SEARCH_MAX_ITERATIONS);

        for _ in 0..iterations {
            if self.exhausted() || hi - lo < 3 {
                break;
            }
            let m1 = lo + (hi - lo) / 3;
            let m2 = hi - (hi - lo) / 3;
            self.ensure_batch(&[m1, m2]);
            let r1 = self.ensure(m1);
            let r2 = self.ensure(m2);
            if RankKey::of(&r1).compare(&RankKey::of(&r2)).is_ge() {
                hi = m2;
            } else {
                lo = m1;
            }
        }
    }

    /// Last index still plausibly holding the subject.
    fn find_cutoff(&mut self, best: usize) -> usize {
        let n = self.n;
        let mut cutoff = n - 1;

        // Evidence already on hand: a no-person frame after the best one.
        let first_no = self
            .scored
            .iter()
            .filter(|(i, r)| **i > best && self.no_person(r))
            .map(|(i, _)| *i)
            .min();
        if let Some(first_no) = first_no {
            if let Some(last_people) = self
                .scored
                .iter()
                .filter(|(i, r)| **i < first_no && !self.no_person(r))
                .map(|(i, _)| *i)
                .max()
            {
                cutoff = last_people;
            }
        }

        // Exponential walk forward from the best frame.
        let mut step = 1usize;
        let mut last_people = best;
        let mut first_no_people: Option<usize> = None;
        while !self.exhausted() {
            let j = best + step;
            if j >= n {
                break;
            }
            let r = self.ensure(j);
            if self.no_person(&r) {
                first_no_people = Some(j);
                break;
            }
            last_people = j;
            step *= 2;
            if step > n {
                break;
            }
        }

        let Some(first_no) = first_no_people else {
            return cutoff;
        };

        // Tighten the boundary between last_people and first_no.
        let mut a = last_people;
        let mut b = first_no;
        while b - a > 1 && !self.exhausted() {
            let mid = (a + b) / 2;
            let r = self.ensure(mid);
            if self.no_person(&r) {
                b = mid;
            } else {
                a = mid;
            }
        }
        let boundary = a;

        // Confirm with a short look-ahead. A person reappearing discards the cutoff.
        let mut confirmed = true;
        if !self.exhausted() {
            for k in 1..=self.lookahead {
                let jj = (b + k).min(n - 1);
                if jj <= boundary || self.exhausted() {
                    continue;
                }
                let r = self.ensure(jj);
                if !self.no_person(&r) {
                    confirmed = false;
                    break;
                }
            }
        }

        if confirmed {
            boundary
        } else {
            cutoff
        }
    }

    /// Spend what is left: neighbors of the best frame, then a seeded
    /// shuffle of everything up to the cutoff.
    fn fill(&mut self, best: usize, cutoff: usize) {
        let max_radius = self.budget.max(NEIGHBOR_MIN_RADIUS);
        let mut radius = 1usize;
        while !self.exhausted() && radius <= max_radius {
            let mut batch = Vec::with_capacity(2);
            if let Some(left) = best.checked_sub(radius) {
                if left <= cutoff {
                    batch.push(left);
                }
            }
            let right = best + radius;
            if right <= cutoff {
                batch.push(right);
            }
            self.ensure_batch(&batch);
            radius += 1;
        }

        if self.exhausted() {
            return;
        }

        let mut candidates: Vec<usize> = (0..=cutoff.min(self.n - 1)).collect();
        candidates.shuffle(&mut self.rng);
        for j in candidates {
            if self.exhausted() {
                break;
            }
            self.ensure(j);
        }
    }

    fn finish(&mut self, cutoff: usize) -> Selection {
        let mut placeholder = false;
        if self.scored.is_empty() {
            self.scored.insert(0, ScoreResult::placeholder());
            placeholder = true;
        }
        let best = best_index(&self.scored).unwrap_or(0);
        let scored_indices = self.scored.keys().copied().collect();

        Selection {
            scored: std::mem::take(&mut self.scored),
            meta: SelectionMeta {
                budget: self.budget,
                scored_indices,
                probe_order: std::mem::take(&mut self.probes),
                cutoff_index_inclusive: cutoff,
                best_index: best,
                placeholder,
            },
        }
    }
}
