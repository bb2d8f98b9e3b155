//! Ranking engine
//!
//! Scores are computed in f64 from integer inputs only and bucketed to
//! integers in [0, 100], so an identical snapshot always yields identical
//! scores and an identical sort order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tagrank_common::config::RankingConfig;
use tagrank_common::models::{
    EngagementCounters, RankingScores, WorkTagAssignment, WorkTagMetrics, WorkTagSummary,
};
use tagrank_common::{Error, TagType, WorkId};

/// Everything a score depends on
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RankingInput {
    pub engagement: EngagementCounters,
    pub total_tag_count: i64,
    pub relationship_tag_count: i64,
    pub primary_relationship_count: i64,
    pub unique_fandom_count: i64,
    pub potential_tag_spam: bool,
    /// Mean prominence score of relationship and character tags
    pub tag_precision: Option<f64>,
}

impl RankingInput {
    pub fn new(
        engagement: EngagementCounters,
        summary: &WorkTagSummary,
        metrics: &WorkTagMetrics,
        assignments: &[WorkTagAssignment],
    ) -> Self {
        Self {
            engagement,
            total_tag_count: summary.total_tag_count,
            relationship_tag_count: summary.relationship_tag_count,
            primary_relationship_count: summary.primary_relationship_count,
            unique_fandom_count: metrics.unique_fandom_count,
            potential_tag_spam: metrics.potential_tag_spam,
            tag_precision: tag_precision(assignments),
        }
    }
}

/// Mean prominence score over relationship and character tags
pub fn tag_precision(assignments: &[WorkTagAssignment]) -> Option<f64> {
    let scores: Vec<f64> = assignments
        .iter()
        .filter(|a| matches!(a.tag_type, TagType::Relationship | TagType::Character))
        .map(|a| a.prominence_score)
        .collect();
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

fn bucket(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Weighted engagement per hit, log-compressed to [0, 1]
fn engagement_component(counters: &EngagementCounters, config: &RankingConfig) -> f64 {
    // f64 sum; weighted external counters can overflow i64
    let weighted = counters.kudos_count as f64 * 2.0
        + counters.bookmark_count as f64 * 3.0
        + counters.comment_count as f64 * 4.0;
    let per_hit = weighted / counters.hits.max(1) as f64;
    (per_hit.ln_1p() / config.engagement_saturation.ln_1p()).min(1.0)
}

/// Comments per hit relative to the saturation density, spam-penalized
fn comment_component(input: &RankingInput, config: &RankingConfig) -> f64 {
    let density = input.engagement.comment_count as f64 / input.engagement.hits.max(1) as f64;
    let quality = (density / config.comment_density_saturation).min(1.0);
    if input.potential_tag_spam {
        quality * config.tag_spam_penalty
    } else {
        quality
    }
}

/// Precision of tagging relative to its reach
///
/// Primary relationships over all relationships, decayed by tag volume past
/// the allowance and divided by the number of fandoms covered.
fn discovery_component(input: &RankingInput, config: &RankingConfig) -> f64 {
    let relationship_precision = if input.relationship_tag_count == 0 {
        config.gen_work_precision
    } else {
        input.primary_relationship_count as f64 / input.relationship_tag_count as f64
    };
    let volume = if input.total_tag_count <= config.tag_volume_allowance {
        1.0
    } else {
        config.tag_volume_allowance as f64 / input.total_tag_count as f64
    };
    let reach = 1.0 / input.unique_fandom_count.max(1) as f64;

    relationship_precision.min(1.0) * volume * reach
}

/// Compute the four composite scores
pub fn score(input: &RankingInput, config: &RankingConfig) -> RankingScores {
    let engagement = engagement_component(&input.engagement, config);
    let comments = comment_component(input, config);
    let discovery = discovery_component(input, config);
    let precision = input.tag_precision.unwrap_or(config.gen_work_precision);

    let weight_sum = config.engagement_weight
        + config.comment_weight
        + config.discovery_weight
        + config.precision_weight;
    let quality = (config.engagement_weight * engagement
        + config.comment_weight * comments
        + config.discovery_weight * discovery
        + config.precision_weight * precision)
        / weight_sum;

    RankingScores {
        quality_score: bucket(quality),
        engagement_rate: bucket(engagement),
        comment_quality: bucket(comments),
        discovery_boost: bucket(discovery),
    }
}

/// Sort key exposed to the search layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    QualityScore,
    EngagementRate,
    CommentQuality,
    DiscoveryBoost,
}

impl SortField {
    /// Column in `work_ranking_scores`
    pub fn column(&self) -> &'static str {
        match self {
            SortField::QualityScore => "quality_score",
            SortField::EngagementRate => "engagement_rate",
            SortField::CommentQuality => "comment_quality",
            SortField::DiscoveryBoost => "discovery_boost",
        }
    }

    fn key(&self, scores: &RankingScores) -> u8 {
        match self {
            SortField::QualityScore => scores.quality_score,
            SortField::EngagementRate => scores.engagement_rate,
            SortField::CommentQuality => scores.comment_quality,
            SortField::DiscoveryBoost => scores.discovery_boost,
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quality_score" => Ok(SortField::QualityScore),
            "engagement_rate" => Ok(SortField::EngagementRate),
            "comment_quality" => Ok(SortField::CommentQuality),
            "discovery_boost" => Ok(SortField::DiscoveryBoost),
            other => Err(Error::InvalidInput(format!("Unknown sort field: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(Error::InvalidInput(format!("Unknown sort order: {}", other))),
        }
    }
}

/// A scored work as the search layer sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedWork {
    pub work_id: WorkId,
    pub word_count: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub scores: RankingScores,
}

/// Total order: chosen key in chosen direction, then `updated_at` DESC, then id ASC
pub fn compare(a: &RankedWork, b: &RankedWork, field: SortField, order: SortOrder) -> Ordering {
    let primary = field.key(&a.scores).cmp(&field.key(&b.scores));
    let primary = match order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    primary
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.work_id.cmp(&b.work_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn counters(hits: i64, kudos: i64, comments: i64, bookmarks: i64) -> EngagementCounters {
        EngagementCounters {
            hits,
            kudos_count: kudos,
            comment_count: comments,
            bookmark_count: bookmarks,
        }
    }

    fn precise_work() -> RankingInput {
        RankingInput {
            engagement: counters(1000, 80, 20, 10),
            total_tag_count: 6,
            relationship_tag_count: 2,
            primary_relationship_count: 2,
            unique_fandom_count: 1,
            potential_tag_spam: false,
            tag_precision: Some(0.9),
        }
    }

    #[test]
    fn test_scores_are_reproducible() {
        let config = RankingConfig::default();
        let input = precise_work();
        assert_eq!(score(&input, &config), score(&input.clone(), &config));
    }

    #[test]
    fn test_huge_counters_saturate() {
        let input = RankingInput {
            engagement: counters(1, i64::MAX, i64::MAX, i64::MAX),
            ..precise_work()
        };
        let scores = score(&input, &RankingConfig::default());
        assert_eq!(scores.engagement_rate, 100);
        assert!(scores.quality_score <= 100);
    }

    #[test]
    fn test_zero_hits_do_not_divide_by_zero() {
        let input = RankingInput {
            engagement: counters(0, 0, 0, 0),
            ..precise_work()
        };
        let scores = score(&input, &RankingConfig::default());
        assert_eq!(scores.engagement_rate, 0);
        assert_eq!(scores.comment_quality, 0);
    }

    #[test]
    fn test_wide_net_tagging_loses_discovery() {
        let config = RankingConfig::default();
        let precise = score(&precise_work(), &config);

        // 40 relationship/character tags, 3 primary, across 4 fandoms
        let orgy = RankingInput {
            total_tag_count: 44,
            relationship_tag_count: 20,
            primary_relationship_count: 3,
            unique_fandom_count: 4,
            tag_precision: Some(0.62),
            ..precise_work()
        };
        let wide = score(&orgy, &config);

        assert!(wide.discovery_boost < precise.discovery_boost);
        assert!(wide.quality_score < precise.quality_score);
        assert_eq!(precise.discovery_boost, 100);
    }

    #[test]
    fn test_spam_flag_penalizes_comment_quality() {
        let config = RankingConfig::default();
        let clean = score(&precise_work(), &config);
        let spam = score(
            &RankingInput {
                potential_tag_spam: true,
                ..precise_work()
            },
            &config,
        );

        // 20 comments / 1000 hits = 0.02 density, 40% of saturation
        assert_eq!(clean.comment_quality, 40);
        assert_eq!(spam.comment_quality, 34);
    }

    #[test]
    fn test_viral_outlier_is_compressed() {
        let config = RankingConfig::default();
        let viral = score(
            &RankingInput {
                engagement: counters(10, 500, 200, 300),
                ..precise_work()
            },
            &config,
        );
        assert_eq!(viral.engagement_rate, 100);
        assert!(viral.quality_score <= 100);
    }

    #[test]
    fn test_default_order_breaks_ties_deterministically() {
        let older = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let scores = |q: u8| RankingScores {
            quality_score: q,
            ..RankingScores::default()
        };
        let id = |n: u128| Uuid::from_u128(n);

        let mut works = vec![
            RankedWork { work_id: id(3), word_count: 1, updated_at: older, scores: scores(50) },
            RankedWork { work_id: id(2), word_count: 1, updated_at: older, scores: scores(50) },
            RankedWork { work_id: id(1), word_count: 1, updated_at: newer, scores: scores(50) },
            RankedWork { work_id: id(4), word_count: 1, updated_at: older, scores: scores(90) },
        ];
        works.sort_by(|a, b| compare(a, b, SortField::QualityScore, SortOrder::Desc));

        let order: Vec<u128> = works.iter().map(|w| w.work_id.as_u128()).collect();
        assert_eq!(order, vec![4, 1, 2, 3]);
    }

    #[test]
    fn test_sort_field_parsing() {
        assert_eq!("discovery_boost".parse::<SortField>().unwrap(), SortField::DiscoveryBoost);
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert!("kudos".parse::<SortField>().is_err());
    }
}
