//! Search filter contract
//!
//! The same predicates exist twice: [`SearchFilter::matches`] evaluates them
//! over loaded records and [`SearchFilter::push_predicates`] pushes them down
//! into SQL. Both must agree.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use tagrank_common::models::{WorkTagAssignment, WorkTagMetrics, WorkTagSummary};
use tagrank_common::{Error, Prominence, TagType};

/// Relationship tag count ranges offered by the search UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipBucket {
    #[serde(rename = "1-2")]
    OneToTwo,
    #[serde(rename = "3-5")]
    ThreeToFive,
    #[serde(rename = "6-10")]
    SixToTen,
    #[serde(rename = "10+")]
    TenOrMore,
}

impl RelationshipBucket {
    /// Inclusive bounds; `None` means unbounded
    pub fn bounds(&self) -> (i64, Option<i64>) {
        match self {
            RelationshipBucket::OneToTwo => (1, Some(2)),
            RelationshipBucket::ThreeToFive => (3, Some(5)),
            RelationshipBucket::SixToTen => (6, Some(10)),
            RelationshipBucket::TenOrMore => (10, None),
        }
    }

    pub fn contains(&self, count: i64) -> bool {
        let (low, high) = self.bounds();
        count >= low && high.map_or(true, |h| count <= h)
    }
}

impl FromStr for RelationshipBucket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1-2" => Ok(RelationshipBucket::OneToTwo),
            "3-5" => Ok(RelationshipBucket::ThreeToFive),
            "6-10" => Ok(RelationshipBucket::SixToTen),
            "10+" => Ok(RelationshipBucket::TenOrMore),
            other => Err(Error::InvalidInput(format!("Unknown relationship count bucket: {}", other))),
        }
    }
}

/// Server-side search predicates
///
/// Field names serialize in the camelCase form the search layer sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchFilter {
    /// With `relationships`: each named relationship must be primary on the
    /// work. Without: the work must have at least one primary relationship.
    pub primary_only: bool,
    pub hide_tag_spam: bool,
    pub max_relationship_tags: Option<i64>,
    /// Word count must be at least this many words per primary/secondary tag
    pub min_words_per_major_tag: Option<i64>,
    pub hide_crossovers: bool,
    pub relationship_count: Option<RelationshipBucket>,
    /// Relationship tags the work must carry (case-insensitive names)
    pub relationships: Vec<String>,
}

impl SearchFilter {
    pub fn validate(&self) -> tagrank_common::Result<()> {
        if matches!(self.max_relationship_tags, Some(n) if n < 0) {
            return Err(Error::InvalidInput("maxRelationshipTags must be non-negative".to_string()));
        }
        if matches!(self.min_words_per_major_tag, Some(n) if n < 0) {
            return Err(Error::InvalidInput("minWordsPerMajorTag must be non-negative".to_string()));
        }
        Ok(())
    }

    /// Evaluate the filter over a work's stored records
    pub fn matches(
        &self,
        word_count: i64,
        summary: &WorkTagSummary,
        metrics: &WorkTagMetrics,
        assignments: &[WorkTagAssignment],
    ) -> bool {
        if self.hide_tag_spam && metrics.potential_tag_spam {
            return false;
        }
        if self.hide_crossovers && metrics.is_crossover {
            return false;
        }
        if let Some(max) = self.max_relationship_tags {
            if summary.relationship_tag_count > max {
                return false;
            }
        }
        if let Some(min) = self.min_words_per_major_tag {
            if word_count < min * summary.major_tag_count.max(1) {
                return false;
            }
        }
        if let Some(bucket) = self.relationship_count {
            if !bucket.contains(summary.relationship_tag_count) {
                return false;
            }
        }

        if self.relationships.is_empty() {
            return !self.primary_only || summary.primary_relationship_count > 0;
        }
        self.relationships.iter().all(|wanted| {
            assignments.iter().any(|a| {
                a.tag_type == TagType::Relationship
                    && a.tag_name.eq_ignore_ascii_case(wanted)
                    && (!self.primary_only || a.prominence == Prominence::Primary)
            })
        })
    }

    /// Append ` AND ...` predicates
    ///
    /// Expects aliases `w` (works), `ws` (work_tag_summaries, LEFT JOIN) and
    /// `wm` (work_tag_metrics, LEFT JOIN).
    pub fn push_predicates(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if self.hide_tag_spam {
            qb.push(" AND COALESCE(wm.potential_tag_spam, 0) = 0");
        }
        if self.hide_crossovers {
            qb.push(" AND COALESCE(wm.is_crossover, 0) = 0");
        }
        if let Some(max) = self.max_relationship_tags {
            qb.push(" AND COALESCE(ws.relationship_tag_count, 0) <= ").push_bind(max);
        }
        if let Some(min) = self.min_words_per_major_tag {
            qb.push(" AND w.word_count >= ")
                .push_bind(min)
                .push(" * MAX(COALESCE(ws.major_tag_count, 0), 1)");
        }
        if let Some(bucket) = self.relationship_count {
            let (low, high) = bucket.bounds();
            qb.push(" AND COALESCE(ws.relationship_tag_count, 0) >= ").push_bind(low);
            if let Some(high) = high {
                qb.push(" AND COALESCE(ws.relationship_tag_count, 0) <= ").push_bind(high);
            }
        }

        if self.relationships.is_empty() {
            if self.primary_only {
                qb.push(" AND COALESCE(ws.primary_relationship_count, 0) > 0");
            }
            return;
        }
        for name in &self.relationships {
            qb.push(
                " AND EXISTS (SELECT 1 FROM work_tag_assignments a JOIN tags t ON t.id = a.tag_id \
                 WHERE a.work_id = w.guid AND t.type = 'relationship' AND t.name = ",
            )
            .push_bind(name.clone());
            if self.primary_only {
                qb.push(" AND a.prominence = 'primary'");
            }
            qb.push(")");
        }
    }
}
