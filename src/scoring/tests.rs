// Scoring: field mapping, tie-break order, pooled fan-out

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::pool::PooledScorer;
use super::ranking::{best_index, pose_rank, rank_best_to_worst};
use super::*;
use crate::config::FieldMapping;

fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

#[test]
fn test_pose_rank_is_case_insensitive() {
    assert_eq!(pose_rank("Standing"), 3);
    assert_eq!(pose_rank(" stationary "), 3);
    assert_eq!(pose_rank("SITTING"), 2);
    assert_eq!(pose_rank("walking"), 1);
    assert_eq!(pose_rank("Moving"), 1);
    assert_eq!(pose_rank(""), 0);
    assert_eq!(pose_rank("crouching"), 0);
}

#[test]
fn test_has_person_outranks_face() {
    let mut scored = BTreeMap::new();
    scored.insert(0, ScoreResult::new(0.0, 10.0, 10.0, "standing", "nobody"));
    scored.insert(1, ScoreResult::new(0.5, 0.0, 0.0, "", ""));
    assert_eq!(best_index(&scored), Some(1));
}

#[test]
fn test_order_falls_through_fields() {
    let mut scored = BTreeMap::new();
    // same face, frame decides
    scored.insert(0, ScoreResult::new(5.0, 3.0, 2.0, "standing", "a"));
    scored.insert(1, ScoreResult::new(5.0, 3.0, 4.0, "walking", "b"));
    // same face+frame as 1, pose decides
    scored.insert(2, ScoreResult::new(5.0, 3.0, 4.0, "sitting", "c"));
    // same as 2 but no summary
    scored.insert(3, ScoreResult::new(5.0, 3.0, 4.0, "sitting", "   "));

    assert_eq!(rank_best_to_worst(&scored), vec![2, 3, 1, 0]);
}

#[test]
fn test_equal_keys_prefer_lowest_index() {
    let mut scored = BTreeMap::new();
    for i in [7, 3, 5] {
        scored.insert(i, ScoreResult::new(2.0, 2.0, 2.0, "standing", "same"));
    }
    assert_eq!(best_index(&scored), Some(3));
    assert_eq!(rank_best_to_worst(&scored), vec![3, 5, 7]);
}

#[test]
fn test_best_index_of_empty_map() {
    assert_eq!(best_index(&BTreeMap::new()), None);
}

#[test]
fn test_from_structured_with_custom_mapping() {
    let mapping = FieldMapping {
        person_score: "people".to_string(),
        face_score: "faces".to_string(),
        frame_score: "composition".to_string(),
        pose: "stance".to_string(),
        summary: "caption".to_string(),
    };
    let data = obj(json!({
        "people": 7,
        "faces": "4.5",
        "composition": 6,
        "stance": "  Standing ",
        "caption": "  a person at the door  ",
        "extra": true,
    }));
    let res = ScoreResult::from_structured(data, &mapping);
    assert_eq!(res.person_score, 7.0);
    assert_eq!(res.face_score, 4.5);
    assert_eq!(res.frame_score, 6.0);
    assert_eq!(res.pose, "standing");
    assert_eq!(res.summary, "a person at the door");
    assert_eq!(res.structured.get("extra"), Some(&Value::Bool(true)));
}

#[test]
fn test_from_structured_fallbacks() {
    let res = ScoreResult::from_structured(obj(json!({"score": 3, "face_score": "n/a"})), &FieldMapping::default());
    assert_eq!(res.person_score, 3.0);
    assert_eq!(res.face_score, 0.0);
    // frame score falls back to person score
    assert_eq!(res.frame_score, 3.0);
    assert_eq!(res.pose, "");
    assert_eq!(res.summary, "");
}

struct MapOracle {
    calls: AtomicUsize,
}

impl ScoringOracle for MapOracle {
    fn score_frame(&self, frame_ref: &str, _instructions: &str, _expected: &[String]) -> anyhow::Result<Map<String, Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if frame_ref.ends_with("bad.jpg") {
            anyhow::bail!("provider returned 500");
        }
        if frame_ref.ends_with("slow.jpg") {
            return Err(anyhow::Error::new(ScoreFailure::Timeout));
        }
        Ok(obj(json!({
            "person_score": 5,
            "summary": format!("seen {}", frame_ref),
            "_meta": {"model": "vision-test"},
        })))
    }
}

#[test]
fn test_oracle_scorer_records_events_and_failures() {
    let oracle = Arc::new(MapOracle { calls: AtomicUsize::new(0) });
    let mut refs = HashMap::new();
    refs.insert(0, "f/ok.jpg".to_string());
    refs.insert(1, "f/bad.jpg".to_string());
    refs.insert(2, "f/slow.jpg".to_string());
    let scorer = OracleScorer::new(oracle.clone(), refs, FieldMapping::default());

    assert!(scorer.score_frame(0).is_ok());
    assert!(matches!(scorer.score_frame(1), Err(ScoreFailure::Provider(_))));
    assert_eq!(scorer.score_frame(2), Err(ScoreFailure::Timeout));
    // gap index never reaches the oracle
    assert_eq!(scorer.score_frame(3), Err(ScoreFailure::MissingFrame));
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);

    let events = scorer.take_events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].model.as_deref(), Some("vision-test"));
    assert_eq!(events[0].summary_preview, "seen f/ok.jpg");
    assert!(events[1].failure.is_some());
    assert!(scorer.take_events().is_empty());
}

#[test]
fn test_pooled_scorer_caps_in_flight_calls() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let scorer = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        ScoreFn(move |i: usize| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            if i == 5 {
                Err(ScoreFailure::Timeout)
            } else {
                Ok(ScoreResult::new(i as f64, 0.0, 0.0, "", ""))
            }
        })
    };
    let pooled = PooledScorer::new(scorer, 3);
    let indices: Vec<usize> = (0..10).collect();
    let results = pooled.score_frames(&indices);

    assert_eq!(results.len(), 10);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let ok: Vec<usize> = results.iter().filter(|(_, r)| r.is_ok()).map(|(i, _)| *i).collect();
    assert_eq!(ok.len(), 9);
    assert!(!ok.contains(&5));
}
