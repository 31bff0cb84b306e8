//! Per-request filtering and aggregation of raw model output.
//!
//! A [`FilterState`] holds the working sets for one batch of interrogations.
//! Records are merged into it with [`FilterState::apply_filters`] and the batch
//! is turned into a single caption with [`FilterState::finalize`]. The state is
//! reset before every batch, never after, so it keeps the last batch's results
//! around for inspection until the next one starts.

use crate::backend::Scores;
use crate::config::FilterConfig;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Final label to score mapping returned to callers. Keys are sorted.
pub type Caption = BTreeMap<String, f32>;

const SUPPLEMENTARY_SCORE: f32 = 1.0;

/// Selection policy applied to every tag a model emits.
pub trait FilterPolicy: Send + Sync {
    /// Whether `label` (already rewritten) with `score` makes it into the result.
    fn accept(&self, label: &str, score: f32) -> bool;

    /// Rename a label before it is filtered.
    fn rewrite<'a>(&self, label: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(label)
    }

    /// Labels always added to the result with full confidence.
    fn supplementary(&self) -> &[String] {
        &[]
    }

    /// Keep only the N best tags in a finalized result.
    fn tag_limit(&self) -> Option<usize> {
        None
    }
}

/// Keeps every label untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl FilterPolicy for PassThrough {
    fn accept(&self, _label: &str, _score: f32) -> bool {
        true
    }
}

/// Score threshold with keep/exclude lists, label replacement and extra tags.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    threshold: f32,
    keep: HashSet<String>,
    exclude: HashSet<String>,
    replace: HashMap<String, String>,
    additional: Vec<String>,
    limit: Option<usize>,
}

impl ThresholdPolicy {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            threshold: config.threshold,
            keep: config.keep_tags.iter().cloned().collect(),
            exclude: config.exclude_tags.iter().cloned().collect(),
            replace: config.replace_tags.iter().cloned().collect(),
            additional: config.additional_tags.clone(),
            limit: config.tag_limit,
        }
    }
}

impl FilterPolicy for ThresholdPolicy {
    fn accept(&self, label: &str, score: f32) -> bool {
        if self.exclude.contains(label) {
            return false;
        }
        self.keep.contains(label) || score >= self.threshold
    }

    fn rewrite<'a>(&self, label: &'a str) -> Cow<'a, str> {
        match self.replace.get(label) {
            Some(replacement) => Cow::Owned(replacement.clone()),
            None => Cow::Borrowed(label),
        }
    }

    fn supplementary(&self) -> &[String] {
        &self.additional
    }

    fn tag_limit(&self) -> Option<usize> {
        self.limit
    }
}

/// One model output plus the identity of the image it came from.
///
/// Identity fields are empty when images are not tracked across calls.
#[derive(Debug, Clone, Default)]
pub struct FilterRecord {
    pub path: String,
    pub key: String,
    pub out_path: String,
    pub ratings: Scores,
    pub tags: Scores,
}

impl FilterRecord {
    /// A record for an image with no persistent identity.
    pub fn anonymous(ratings: Scores, tags: Scores) -> Self {
        Self {
            ratings,
            tags,
            ..Self::default()
        }
    }
}

/// Working sets for one batch.
#[derive(Debug, Default)]
pub struct FilterState {
    ratings: HashMap<String, f32>,
    tags: HashMap<String, f32>,
    in_db: HashSet<String>,
    for_tags_file: HashSet<String>,
    applied: usize,
}

/// Averaged, filtered output of a batch, split by source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Finalized {
    pub ratings: Caption,
    pub tags: Caption,
    pub supplementary: Caption,
}

impl Finalized {
    /// Merge ratings, then tags, then supplementary entries. Later sources win
    /// on key collisions.
    pub fn merge(self) -> Caption {
        let mut caption = self.ratings;
        caption.extend(self.tags);
        caption.extend(self.supplementary);
        caption
    }
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every container, whatever a previous batch left behind.
    pub fn reset(&mut self) {
        self.ratings.clear();
        self.tags.clear();
        self.in_db.clear();
        self.for_tags_file.clear();
        self.applied = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
            && self.tags.is_empty()
            && self.in_db.is_empty()
            && self.for_tags_file.is_empty()
    }

    pub fn ratings(&self) -> &HashMap<String, f32> {
        &self.ratings
    }

    pub fn tags(&self) -> &HashMap<String, f32> {
        &self.tags
    }

    /// Labels resolved by the filter stage during this batch.
    pub fn in_db(&self) -> &HashSet<String> {
        &self.in_db
    }

    /// Labels selected for an auxiliary tags file.
    pub fn for_tags_file(&self) -> &HashSet<String> {
        &self.for_tags_file
    }

    /// Number of records merged since the last reset.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Merge one record into the batch.
    ///
    /// Non-finite scores are dropped before anything else. Ratings are
    /// accumulated unfiltered. Tags are visited best-first, renamed and
    /// filtered by `policy`; when two labels collapse into one after renaming,
    /// only the higher score counts.
    pub fn apply_filters(&mut self, record: FilterRecord, policy: &dyn FilterPolicy) {
        let FilterRecord {
            out_path,
            ratings,
            tags,
            ..
        } = record;

        for (rating, score) in finite(ratings) {
            *self.ratings.entry(rating).or_insert(0.0) += score;
        }

        let mut ranked: Vec<(String, f32)> = finite(tags).collect();
        ranked.sort_by(by_score_desc);

        let mut seen = HashSet::with_capacity(ranked.len());
        for (label, score) in ranked {
            let label = policy.rewrite(&label).into_owned();
            if !policy.accept(&label, score) || !seen.insert(label.clone()) {
                continue;
            }

            *self.tags.entry(label.clone()).or_insert(0.0) += score;
            if !out_path.is_empty() {
                self.for_tags_file.insert(label.clone());
            }
            self.in_db.insert(label);
        }

        self.applied += 1;
    }

    /// Average the batch over `count` images and split it into result sources.
    ///
    /// `count` is clamped to at least one.
    pub fn finalize(&self, count: usize, policy: &dyn FilterPolicy) -> Finalized {
        let divisor = count.max(1) as f32;

        let ratings = self
            .ratings
            .iter()
            .map(|(label, score)| (label.clone(), score / divisor))
            .collect();

        let mut ranked: Vec<(String, f32)> = self
            .tags
            .iter()
            .map(|(label, score)| (label.clone(), score / divisor))
            .collect();
        if let Some(limit) = policy.tag_limit() {
            ranked.sort_by(by_score_desc);
            ranked.truncate(limit);
        }

        let supplementary = policy
            .supplementary()
            .iter()
            .map(|label| (label.clone(), SUPPLEMENTARY_SCORE))
            .collect();

        Finalized {
            ratings,
            tags: ranked.into_iter().collect(),
            supplementary,
        }
    }
}

fn finite(scores: Scores) -> impl Iterator<Item = (String, f32)> {
    scores.into_iter().filter(|(label, score)| {
        let keep = score.is_finite();
        if !keep {
            tracing::debug!(label = %label, score = %score, "Dropping non-finite score");
        }
        keep
    })
}

fn by_score_desc(a: &(String, f32), b: &(String, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}
