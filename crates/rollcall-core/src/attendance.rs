//! Attendance matching: one photo of a group → who is present.

use crate::extractor::{ExtractError, FaceExtractor};
use crate::gallery::{GalleryIndex, GallerySnapshot};
use crate::resolver::{MatchOutcome, MatchResolver, MatchResult};
use crate::types::OwnerId;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
}

impl OutcomeCounts {
    fn tally(results: &[MatchResult]) -> Self {
        let mut counts = Self::default();
        for r in results {
            match r.outcome {
                MatchOutcome::Matched => counts.matched += 1,
                MatchOutcome::Unmatched => counts.unmatched += 1,
                MatchOutcome::Ambiguous { .. } => counts.ambiguous += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.matched + self.unmatched + self.ambiguous
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceReport {
    /// Version of the gallery snapshot every face was compared against.
    pub gallery_version: u64,
    /// One result per detected face, highest detection score first.
    pub results: Vec<MatchResult>,
    pub counts: OutcomeCounts,
}

impl AttendanceReport {
    /// Owners matched in this photo, in face order.
    pub fn attendees(&self) -> Vec<&OwnerId> {
        self.results
            .iter()
            .filter(|r| r.is_matched())
            .filter_map(|r| r.owner_id.as_ref())
            .collect()
    }

    pub fn total_faces(&self) -> usize {
        self.results.len()
    }
}

pub struct AttendanceMatchPipeline {
    extractor: FaceExtractor,
    gallery: Arc<GalleryIndex>,
    resolver: MatchResolver,
}

impl AttendanceMatchPipeline {
    pub fn new(extractor: FaceExtractor, gallery: Arc<GalleryIndex>, resolver: MatchResolver) -> Self {
        Self {
            extractor,
            gallery,
            resolver,
        }
    }

    /// Match every face in `image` against the whole gallery.
    ///
    /// Never mutates the gallery. A photo with no faces yields an empty report.
    pub fn identify(&self, image: &[u8]) -> Result<AttendanceReport, ExtractError> {
        let snapshot = self.gallery.all();
        self.run(image, &snapshot)
    }

    /// Like [`identify`](Self::identify), restricted to a class roster.
    ///
    /// Owners outside `roster` are invisible to this call, so they can neither
    /// match nor narrow the margin of a roster member.
    pub fn identify_among(&self, image: &[u8], roster: &HashSet<OwnerId>) -> Result<AttendanceReport, ExtractError> {
        let full = self.gallery.all();
        let restricted = GallerySnapshot {
            version: full.version,
            entries: full
                .entries
                .iter()
                .filter(|e| roster.contains(&e.owner_id))
                .cloned()
                .collect(),
        };
        tracing::debug!(
            roster = roster.len(),
            embeddings = restricted.len(),
            "gallery restricted to roster"
        );
        self.run(image, &restricted)
    }

    fn run(&self, image: &[u8], snapshot: &GallerySnapshot) -> Result<AttendanceReport, ExtractError> {
        let faces = self.extractor.extract(image)?;
        let results = self.resolver.resolve_all(&faces, snapshot);
        let counts = OutcomeCounts::tally(&results);

        tracing::info!(
            faces = results.len(),
            matched = counts.matched,
            unmatched = counts.unmatched,
            ambiguous = counts.ambiguous,
            gallery_version = snapshot.version,
            "attendance photo matched"
        );

        Ok(AttendanceReport {
            gallery_version: snapshot.version,
            results,
            counts,
        })
    }
}
