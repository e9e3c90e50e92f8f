// Tie-break order over scored frames
//
// Descending priority: has person, face, frame, pose rank, person score,
// has summary. Equal keys go to the lowest frame index.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::constants::POSE_RANKS;
use super::ScoreResult;

/// Case-insensitive pose rank; unknown and empty poses rank 0.
pub fn pose_rank(pose: &str) -> u8 {
    let p = pose.trim().to_lowercase();
    POSE_RANKS
        .iter()
        .find(|(name, _)| *name == p)
        .map(|(_, rank)| *rank)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankKey {
    pub has_person: u8,
    pub face_score: f64,
    pub frame_score: f64,
    pub pose_rank: u8,
    pub person_score: f64,
    pub has_summary: u8,
}

impl RankKey {
    pub fn of(res: &ScoreResult) -> Self {
        Self {
            has_person: u8::from(res.has_person()),
            face_score: res.face_score,
            frame_score: res.frame_score,
            pose_rank: pose_rank(&res.pose),
            person_score: res.person_score,
            has_summary: u8::from(!res.summary.trim().is_empty()),
        }
    }

    /// Greater means better.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.has_person
            .cmp(&other.has_person)
            .then_with(|| self.face_score.total_cmp(&other.face_score))
            .then_with(|| self.frame_score.total_cmp(&other.frame_score))
            .then_with(|| self.pose_rank.cmp(&other.pose_rank))
            .then_with(|| self.person_score.total_cmp(&other.person_score))
            .then_with(|| self.has_summary.cmp(&other.has_summary))
    }
}

/// Full order between two scored frames. Greater means better; on equal
/// keys the lower index is better.
pub fn compare_frames(a: (usize, &ScoreResult), b: (usize, &ScoreResult)) -> Ordering {
    RankKey::of(a.1)
        .compare(&RankKey::of(b.1))
        .then_with(|| b.0.cmp(&a.0))
}

/// Argmax under the tie-break order.
pub fn best_index(scored: &BTreeMap<usize, ScoreResult>) -> Option<usize> {
    scored
        .iter()
        .max_by(|a, b| compare_frames((*a.0, a.1), (*b.0, b.1)))
        .map(|(i, _)| *i)
}

/// All scored indices, best first.
pub fn rank_best_to_worst(scored: &BTreeMap<usize, ScoreResult>) -> Vec<usize> {
    let mut entries: Vec<(usize, &ScoreResult)> = scored.iter().map(|(i, r)| (*i, r)).collect();
    entries.sort_by(|a, b| compare_frames(*b, *a));
    entries.into_iter().map(|(i, _)| i).collect()
}
