//! Match policy: turns a query face plus a gallery snapshot into a decision.
//!
//! Per face, the best reference photo of each owner is that owner's score.
//! The top owner must clear `match_threshold` and beat the runner-up by at
//! least `margin`; a close runner-up makes the face Ambiguous instead of
//! letting a near-tie pick someone. Across one image, an owner can be
//! Matched at most once: extra faces claiming the same owner are demoted.

use crate::gallery::GallerySnapshot;
use crate::types::{DetectedFace, Embedding, EmbeddingId, EnrolledEmbedding, OwnerId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Absorbs f32 rounding when a gap sits exactly on the margin.
const MARGIN_EPSILON: f32 = 1e-6;

/// Decision thresholds. Calibrate against the deployed model's score
/// distribution; the defaults suit ArcFace w600k_r50.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Minimum owner similarity to accept a match.
    pub match_threshold: f32,
    /// Minimum gap between the best and second-best owner.
    pub margin: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.55,
            margin: 0.15,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolverConfigError {
    #[error("match_threshold must be a finite value in [-1, 1], got {0}")]
    Threshold(f32),
    #[error("margin must be finite and non-negative, got {0}")]
    Margin(f32),
}

impl ResolverConfig {
    /// Reject values that would let NaN comparisons or a negative gap decide a match.
    pub fn validate(&self) -> Result<(), ResolverConfigError> {
        if !(-1.0..=1.0).contains(&self.match_threshold) {
            return Err(ResolverConfigError::Threshold(self.match_threshold));
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(ResolverConfigError::Margin(self.margin));
        }
        Ok(())
    }
}

/// An owner's best similarity against one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerScore {
    pub owner_id: OwnerId,
    pub similarity: f32,
    /// The owner's reference embedding that produced `similarity`.
    pub embedding_id: EmbeddingId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityReason {
    /// Best and runner-up owners are closer than the margin.
    NarrowMargin,
    /// Another face in the same image matched this owner more strongly.
    DuplicateOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched,
    Unmatched,
    Ambiguous { reason: AmbiguityReason },
}

/// Decision for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Position of the face in the extractor's ordering.
    pub face_index: usize,
    pub face: DetectedFace,
    /// Set only when `outcome` is `Matched`.
    pub owner_id: Option<OwnerId>,
    /// Best owner similarity, or 0.0 against an empty gallery.
    pub similarity: f32,
    pub outcome: MatchOutcome,
    /// Best and runner-up owners, in rank order.
    pub candidates: Vec<OwnerScore>,
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        self.outcome == MatchOutcome::Matched
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Ambiguous { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchResolver {
    config: ResolverConfig,
}

impl MatchResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, ResolverConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Score every owner by their best-matching reference, highest first.
    ///
    /// Equal scores are ordered by owner id so ranking is deterministic.
    pub fn rank_owners(&self, query: &Embedding, gallery: &[EnrolledEmbedding]) -> Vec<OwnerScore> {
        let mut best: HashMap<&OwnerId, (f32, &EmbeddingId)> = HashMap::new();
        for e in gallery {
            let sim = query.similarity(&e.vector);
            best.entry(&e.owner_id)
                .and_modify(|cur| {
                    if sim > cur.0 {
                        *cur = (sim, &e.embedding_id);
                    }
                })
                .or_insert((sim, &e.embedding_id));
        }

        let mut ranked: Vec<OwnerScore> = best
            .into_iter()
            .map(|(owner, (similarity, id))| OwnerScore {
                owner_id: owner.clone(),
                similarity,
                embedding_id: id.clone(),
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.owner_id.cmp(&b.owner_id))
        });
        ranked
    }

    /// Apply the threshold and margin policy to a ranking.
    pub fn decide(&self, ranked: &[OwnerScore]) -> MatchOutcome {
        let Some(best) = ranked.first() else {
            return MatchOutcome::Unmatched;
        };
        if best.similarity.is_nan() || best.similarity < self.config.match_threshold {
            return MatchOutcome::Unmatched;
        }
        match ranked.get(1) {
            None => MatchOutcome::Matched,
            Some(second) if best.similarity - second.similarity + MARGIN_EPSILON >= self.config.margin => {
                MatchOutcome::Matched
            }
            Some(_) => MatchOutcome::Ambiguous {
                reason: AmbiguityReason::NarrowMargin,
            },
        }
    }

    /// Resolve one face against a snapshot.
    pub fn resolve(&self, face_index: usize, face: &DetectedFace, snapshot: &GallerySnapshot) -> MatchResult {
        let mut ranked = self.rank_owners(&face.embedding, &snapshot.entries);
        let outcome = self.decide(&ranked);
        ranked.truncate(2);

        let similarity = ranked.first().map_or(0.0, |s| s.similarity);
        let owner_id = match outcome {
            MatchOutcome::Matched => ranked.first().map(|s| s.owner_id.clone()),
            _ => None,
        };

        tracing::trace!(
            face_index,
            similarity,
            ?outcome,
            owner = ?owner_id,
            "face resolved"
        );

        MatchResult {
            face_index,
            face: face.clone(),
            owner_id,
            similarity,
            outcome,
            candidates: ranked,
        }
    }

    /// Resolve every face of one image independently, then deduplicate owners.
    pub fn resolve_all(&self, faces: &[DetectedFace], snapshot: &GallerySnapshot) -> Vec<MatchResult> {
        let mut results: Vec<MatchResult> = faces
            .iter()
            .enumerate()
            .map(|(i, face)| self.resolve(i, face, snapshot))
            .collect();
        deduplicate(&mut results);
        results
    }
}

/// Keep at most one Matched result per owner within one image.
///
/// The highest similarity wins (earlier face on an exact tie); the rest become
/// `Ambiguous { DuplicateOwner }` and lose their owner id.
pub fn deduplicate(results: &mut [MatchResult]) {
    let mut winner: HashMap<OwnerId, usize> = HashMap::new();
    for (i, r) in results.iter().enumerate() {
        let Some(owner) = r.owner_id.as_ref().filter(|_| r.is_matched()) else {
            continue;
        };
        let replace = winner.get(owner).map_or(true, |&w| beats(r, &results[w]));
        if replace {
            winner.insert(owner.clone(), i);
        }
    }

    for (i, r) in results.iter_mut().enumerate() {
        let Some(owner) = r.owner_id.as_ref().filter(|_| r.is_matched()) else {
            continue;
        };
        if winner.get(owner) != Some(&i) {
            tracing::debug!(
                face_index = r.face_index,
                %owner,
                similarity = r.similarity,
                "duplicate owner match demoted"
            );
            r.outcome = MatchOutcome::Ambiguous {
                reason: AmbiguityReason::DuplicateOwner,
            };
            r.owner_id = None;
        }
    }
}

fn beats(a: &MatchResult, b: &MatchResult) -> bool {
    match a.similarity.total_cmp(&b.similarity) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => a.face_index < b.face_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn face(embedding: Embedding) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 50.0, height: 50.0 },
            landmarks: [(0.0, 0.0); 5],
            embedding,
            detection_score: 0.9,
        }
    }

    fn entry(id: &str, owner: &str, v: Vec<f32>) -> EnrolledEmbedding {
        let mut e = EnrolledEmbedding::new(OwnerId::new(owner), Embedding::from_raw(v), "ref.jpg");
        e.embedding_id = EmbeddingId::new(id);
        e
    }

    fn snapshot(entries: Vec<EnrolledEmbedding>) -> GallerySnapshot {
        GallerySnapshot { version: 1, entries }
    }

    /// Owners A and B with cos(vA, vB) = 0.3.
    fn two_owner_gallery() -> GallerySnapshot {
        snapshot(vec![
            entry("a1", "A", vec![1.0, 0.0, 0.0]),
            entry("b1", "B", vec![0.3, 0.91f32.sqrt(), 0.0]),
        ])
    }

    /// Unit query with the given cosines to vA and vB of `two_owner_gallery`.
    fn query(cos_a: f32, cos_b: f32) -> Embedding {
        let y = (cos_b - 0.3 * cos_a) / 0.91f32.sqrt();
        let z = (1.0 - cos_a * cos_a - y * y).sqrt();
        Embedding::from_raw(vec![cos_a, y, z])
    }

    #[test]
    fn test_scenario_clear_match() {
        let r = MatchResolver::default().resolve(0, &face(query(0.85, 0.40)), &two_owner_gallery());
        assert_eq!(r.outcome, MatchOutcome::Matched);
        assert_eq!(r.owner_id, Some(OwnerId::new("A")));
        assert!((r.similarity - 0.85).abs() < 1e-4);
        assert_eq!(r.candidates.len(), 2);
        assert!((r.candidates[1].similarity - 0.40).abs() < 1e-4);
    }

    #[test]
    fn test_scenario_narrow_margin_is_ambiguous() {
        let r = MatchResolver::default().resolve(0, &face(query(0.62, 0.59)), &two_owner_gallery());
        assert_eq!(
            r.outcome,
            MatchOutcome::Ambiguous { reason: AmbiguityReason::NarrowMargin }
        );
        assert_eq!(r.owner_id, None);
        assert_eq!(r.candidates[0].owner_id, OwnerId::new("A"));
        assert_eq!(r.candidates[1].owner_id, OwnerId::new("B"));
    }

    #[test]
    fn test_scenario_duplicate_owner_in_one_image() {
        let faces = vec![face(query(0.9, 0.3)), face(query(0.7, 0.2))];
        let results = MatchResolver::default().resolve_all(&faces, &two_owner_gallery());
        assert_eq!(results[0].outcome, MatchOutcome::Matched);
        assert_eq!(results[0].owner_id, Some(OwnerId::new("A")));
        assert!((results[0].similarity - 0.9).abs() < 1e-4);
        assert_eq!(
            results[1].outcome,
            MatchOutcome::Ambiguous { reason: AmbiguityReason::DuplicateOwner }
        );
        assert_eq!(results[1].owner_id, None);
        assert_eq!(results[1].candidates[0].owner_id, OwnerId::new("A"));
    }

    #[test]
    fn test_duplicate_owner_stronger_match_later_wins() {
        let faces = vec![face(query(0.7, 0.2)), face(query(0.9, 0.3))];
        let results = MatchResolver::default().resolve_all(&faces, &two_owner_gallery());
        assert!(results[0].is_ambiguous());
        assert!(results[1].is_matched());
    }

    #[test]
    fn test_duplicate_exact_tie_keeps_earlier_face() {
        let q = query(0.8, 0.2);
        let results = MatchResolver::default().resolve_all(&[face(q.clone()), face(q)], &two_owner_gallery());
        assert!(results[0].is_matched());
        assert!(results[1].is_ambiguous());
    }

    #[test]
    fn test_below_threshold_is_unmatched() {
        let r = MatchResolver::default().resolve(0, &face(query(0.5, 0.1)), &two_owner_gallery());
        assert_eq!(r.outcome, MatchOutcome::Unmatched);
        assert!((r.similarity - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_empty_gallery_is_unmatched() {
        let r = MatchResolver::default().resolve(0, &face(query(0.9, 0.3)), &snapshot(vec![]));
        assert_eq!(r.outcome, MatchOutcome::Unmatched);
        assert_eq!(r.similarity, 0.0);
        assert!(r.candidates.is_empty());
    }

    #[test]
    fn test_single_owner_needs_no_margin() {
        let gallery = snapshot(vec![entry("a1", "A", vec![1.0, 0.0, 0.0])]);
        let r = MatchResolver::default().resolve(0, &face(query(0.56, 0.0)), &gallery);
        assert_eq!(r.outcome, MatchOutcome::Matched);
    }

    #[test]
    fn test_owner_best_photo_wins() {
        // B has a weak photo and a strong one; only the strong one counts.
        let mut entries = two_owner_gallery().entries;
        entries.push(entry("b2", "B", vec![0.0, 0.0, 1.0]));
        let gallery = snapshot(entries);
        let ranked = MatchResolver::default().rank_owners(&Embedding::from_raw(vec![0.0, 0.1, 1.0]), &gallery.entries);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].owner_id, OwnerId::new("B"));
        assert_eq!(ranked[0].embedding_id, EmbeddingId::new("b2"));
    }

    #[test]
    fn test_twins_never_silently_matched() {
        // Two owners enrolled with nearly identical vectors.
        let gallery = snapshot(vec![
            entry("t1", "twin-1", vec![1.0, 0.02, 0.0]),
            entry("t2", "twin-2", vec![1.0, -0.02, 0.0]),
        ]);
        let r = MatchResolver::default().resolve(0, &face(Embedding::from_raw(vec![1.0, 0.0, 0.0])), &gallery);
        assert!(r.is_ambiguous());
        assert_eq!(r.owner_id, None);
    }

    #[test]
    fn test_exact_tie_ranks_by_owner_id() {
        let gallery = snapshot(vec![
            entry("z", "zoe", vec![1.0, 0.0]),
            entry("a", "amy", vec![1.0, 0.0]),
        ]);
        let ranked = MatchResolver::default().rank_owners(&Embedding::from_raw(vec![1.0, 0.0]), &gallery.entries);
        assert_eq!(ranked[0].owner_id, OwnerId::new("amy"));
        assert_eq!(
            MatchResolver::default().decide(&ranked),
            MatchOutcome::Ambiguous { reason: AmbiguityReason::NarrowMargin }
        );
    }

    #[test]
    fn test_margin_boundary_counts_as_match() {
        let resolver = MatchResolver::new(ResolverConfig { match_threshold: 0.55, margin: 0.15 }).unwrap();
        let ranked = vec![
            OwnerScore { owner_id: OwnerId::new("A"), similarity: 0.70, embedding_id: EmbeddingId::new("a") },
            OwnerScore { owner_id: OwnerId::new("B"), similarity: 0.55, embedding_id: EmbeddingId::new("b") },
        ];
        assert_eq!(resolver.decide(&ranked), MatchOutcome::Matched);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let nan = ResolverConfig { match_threshold: f32::NAN, margin: 0.15 };
        assert!(matches!(MatchResolver::new(nan), Err(ResolverConfigError::Threshold(t)) if t.is_nan()));

        let above = ResolverConfig { match_threshold: 1.5, margin: 0.15 };
        assert_eq!(above.validate(), Err(ResolverConfigError::Threshold(1.5)));

        let negative = ResolverConfig { match_threshold: 0.55, margin: -0.1 };
        assert_eq!(negative.validate(), Err(ResolverConfigError::Margin(-0.1)));

        let infinite = ResolverConfig { match_threshold: 0.55, margin: f32::INFINITY };
        assert!(MatchResolver::new(infinite).is_err());

        assert!(ResolverConfig { match_threshold: -1.0, margin: 0.0 }.validate().is_ok());
        assert!(ResolverConfig::default().validate().is_ok());
    }

    #[test]
    fn test_nan_score_is_unmatched() {
        let ranked = vec![OwnerScore { owner_id: OwnerId::new("A"), similarity: f32::NAN, embedding_id: EmbeddingId::new("a") }];
        assert_eq!(MatchResolver::default().decide(&ranked), MatchOutcome::Unmatched);
    }

    #[test]
    fn test_every_enrolled_vector_matches_itself() {
        let mut rng = StdRng::seed_from_u64(7);
        let entries: Vec<EnrolledEmbedding> = (0..25)
            .map(|i| {
                let v: Vec<f32> = (0..128).map(|_| rng.gen_range(-1.0..1.0)).collect();
                entry(&format!("e{i}"), &format!("owner{i}"), v)
            })
            .collect();
        let gallery = snapshot(entries);
        let resolver = MatchResolver::default();

        for e in &gallery.entries {
            let r = resolver.resolve(0, &face(e.vector.clone()), &gallery);
            assert!(r.similarity >= resolver.config().match_threshold);
            assert_eq!(r.outcome, MatchOutcome::Matched, "owner {}", e.owner_id);
            assert_eq!(r.owner_id.as_ref(), Some(&e.owner_id));
        }
    }

    #[test]
    fn test_resolve_all_is_idempotent() {
        let faces = vec![face(query(0.85, 0.4)), face(query(0.62, 0.59)), face(query(0.2, 0.1))];
        let resolver = MatchResolver::default();
        let gallery = two_owner_gallery();
        assert_eq!(resolver.resolve_all(&faces, &gallery), resolver.resolve_all(&faces, &gallery));
    }

    #[test]
    fn test_outcome_serializes_with_reason() {
        let json = serde_json::to_value(MatchOutcome::Ambiguous { reason: AmbiguityReason::DuplicateOwner }).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "ambiguous", "reason": "duplicate_owner" }));
    }
}
