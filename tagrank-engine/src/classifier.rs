//! Prominence classifier
//!
//! [`classify`] decides prominence for every auto-assigned tag of a work.
//! It is pure and deterministic: the output depends only on the tag list,
//! the word count, the rule set and the configuration, never on the
//! prominence the tags currently hold. Running it twice is therefore a no-op
//! the second time.
//!
//! Tags an author has set (`auto_assigned = false`) are passed through
//! untouched, and their primary relationships count against the cap.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::cmp::Ordering;
use tagrank_common::config::{ClassifierConfig, TomlConfig};
use tagrank_common::models::{WorkTagAssignment, WorkTagMetrics, WorkTagSummary};
use tagrank_common::{time, Error, Prominence, Result, TagId, TagType, ValidationError, WorkId};
use tracing::{debug, info};

use crate::rules::{is_incidental, RuleSet};
use crate::works::{self, WorkRecord};
use crate::{metrics, summary};

/// Result of classifying one work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifyOutcome {
    pub assignments: Vec<WorkTagAssignment>,
    /// Assignments whose stored state changed
    pub changed: usize,
    pub summary: WorkTagSummary,
    pub metrics: WorkTagMetrics,
}

/// Result of an author override
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideOutcome {
    pub assignment: WorkTagAssignment,
    pub summary: WorkTagSummary,
    pub metrics: WorkTagMetrics,
}

/// Score for a prominence level before any confidence multiplier
pub fn base_score(prominence: Prominence, config: &ClassifierConfig) -> f64 {
    match prominence {
        Prominence::Primary => config.primary_score,
        Prominence::Secondary => config.secondary_score,
        Prominence::Micro => config.micro_score,
        Prominence::Unassigned => 0.0,
    }
}

/// Prominence for a tag no rule names
fn type_default(
    assignment: &WorkTagAssignment,
    relationship_count: usize,
    config: &ClassifierConfig,
) -> Prominence {
    match assignment.tag_type {
        TagType::Relationship => {
            if is_incidental(&assignment.tag_name, &config.incidental_markers) {
                Prominence::Micro
            } else if relationship_count <= config.relationship_primary_candidate_max {
                Prominence::Primary
            } else {
                Prominence::Secondary
            }
        }
        TagType::Character | TagType::Freeform | TagType::Fandom | TagType::Additional => {
            Prominence::Secondary
        }
        TagType::Rating | TagType::Warning | TagType::Category => Prominence::Micro,
    }
}

/// Cap tie-break: rules not needing review, then oldest, then name, then id
fn cap_order(a: &WorkTagAssignment, b: &WorkTagAssignment) -> Ordering {
    a.needs_review
        .cmp(&b.needs_review)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.tag_name.cmp(&b.tag_name))
        .then_with(|| a.tag_id.cmp(&b.tag_id))
}

/// Classify a work's assignments
///
/// Returns the assignments in input order with new state for every
/// auto-assigned tag.
pub fn classify(
    assignments: &[WorkTagAssignment],
    word_count: i64,
    rules: &RuleSet,
    config: &ClassifierConfig,
) -> Vec<WorkTagAssignment> {
    let relationship_count = assignments
        .iter()
        .filter(|a| a.tag_type == TagType::Relationship)
        .count();
    let auto_primary_allowed = assignments.len() <= config.auto_primary_max_total_tags;
    let manual_primaries = assignments
        .iter()
        .filter(|a| !a.auto_assigned)
        .filter(|a| a.tag_type == TagType::Relationship && a.prominence == Prominence::Primary)
        .count();

    let mut result = assignments.to_vec();
    let mut candidates: Vec<usize> = Vec::new();

    for (index, assignment) in result.iter_mut().enumerate() {
        if !assignment.auto_assigned {
            continue;
        }

        let (mut prominence, word_threshold, needs_review) =
            match rules.lookup(&assignment.tag_name, assignment.tag_type) {
                Some(rule) => (
                    rule.default_prominence,
                    rule.min_word_threshold,
                    rule.requires_manual_review,
                ),
                None => (
                    type_default(assignment, relationship_count, config),
                    config.default_min_word_threshold,
                    false,
                ),
            };

        if prominence == Prominence::Primary && (word_count < word_threshold || !auto_primary_allowed) {
            prominence = Prominence::Secondary;
        }
        if prominence == Prominence::Primary && assignment.tag_type == TagType::Relationship {
            candidates.push(index);
        }

        assignment.prominence = prominence;
        assignment.needs_review = needs_review;
        assignment.migration_batch = Some(rules.version());
    }

    let available = config.primary_relationship_cap.saturating_sub(manual_primaries);
    candidates.sort_by(|&x, &y| cap_order(&result[x], &result[y]));
    for &index in candidates.iter().skip(available) {
        result[index].prominence = Prominence::Secondary;
    }

    for assignment in result.iter_mut().filter(|a| a.auto_assigned) {
        let confidence = if assignment.needs_review {
            config.manual_review_confidence
        } else {
            1.0
        };
        assignment.prominence_score = base_score(assignment.prominence, config) * confidence;
    }

    result
}

/// Recompute summary and metrics for a work inside the caller's transaction
pub async fn refresh_derived(
    conn: &mut SqliteConnection,
    work: &WorkRecord,
    assignments: &[WorkTagAssignment],
    config: &TomlConfig,
) -> Result<(WorkTagSummary, WorkTagMetrics)> {
    let summary = summary::refresh_summary(conn, work.id, assignments, &config.metrics).await?;
    let metrics = metrics::refresh_metrics(
        conn,
        work.id,
        work.word_count,
        assignments,
        &config.metrics,
        &config.taxonomy,
    )
    .await?;
    Ok((summary, metrics))
}

/// Classify a stored work and persist changed assignments
///
/// Writes only assignments whose state changed, bumps the work's tag
/// version when anything changed, then refreshes summary and metrics. Run
/// it inside a transaction.
pub async fn classify_work(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    rules: &RuleSet,
    config: &TomlConfig,
) -> Result<ClassifyOutcome> {
    let work = works::require_work(conn, work_id).await?;
    let current = works::load_assignments(conn, work_id).await?;
    let classified = classify(&current, work.word_count, rules, &config.classifier);

    let now = time::now();
    let changed = persist_changes(conn, &current, &classified, now).await?;
    if changed > 0 {
        works::bump_tag_version(conn, work_id, now).await?;
    }

    let (summary, metrics) = refresh_derived(conn, &work, &classified, config).await?;

    debug!(
        work_id = %work_id,
        rule_version = rules.version(),
        changed,
        primary_relationships = summary.primary_relationship_count,
        "Classified work"
    );

    Ok(ClassifyOutcome {
        assignments: classified,
        changed,
        summary,
        metrics,
    })
}

async fn persist_changes(
    conn: &mut SqliteConnection,
    before: &[WorkTagAssignment],
    after: &[WorkTagAssignment],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut changed = 0;
    for (old, new) in before.iter().zip(after) {
        if old != new {
            works::write_assignment(conn, new, now).await?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Author override of one tag's prominence
///
/// Always leaves the tag `auto_assigned = false`. Promoting a relationship
/// tag past the primary cap fails with `CapacityExceeded` naming the tags
/// holding the slots; nothing is written on any failure.
pub async fn set_prominence(
    conn: &mut SqliteConnection,
    work_id: WorkId,
    tag_id: TagId,
    level: Prominence,
    config: &TomlConfig,
) -> Result<OverrideOutcome> {
    if level == Prominence::Unassigned {
        return Err(ValidationError::ManualUnassign { tag_id }.into());
    }

    let work = works::require_work(conn, work_id).await?;
    let mut assignments = works::load_assignments(conn, work_id).await?;
    let index = assignments
        .iter()
        .position(|a| a.tag_id == tag_id)
        .ok_or(ValidationError::NotAttached { work_id, tag_id })?;

    let target = &assignments[index];
    if level == Prominence::Primary && target.tag_type == TagType::Relationship {
        let cap = config.classifier.primary_relationship_cap;
        let mut blocking: Vec<String> = assignments
            .iter()
            .filter(|a| a.tag_id != tag_id)
            .filter(|a| a.tag_type == TagType::Relationship && a.prominence == Prominence::Primary)
            .map(|a| a.tag_name.clone())
            .collect();

        if blocking.len() >= cap {
            blocking.sort();
            return Err(Error::Validation(ValidationError::CapacityExceeded {
                work_id,
                tag_id,
                tag_name: target.tag_name.clone(),
                cap,
                blocking_tags: blocking,
            }));
        }
    }

    let updated = {
        let assignment = &mut assignments[index];
        assignment.prominence = level;
        assignment.prominence_score = base_score(level, &config.classifier);
        assignment.auto_assigned = false;
        assignment.needs_review = false;
        assignment.clone()
    };

    let now = time::now();
    works::write_assignment(conn, &updated, now).await?;
    works::bump_tag_version(conn, work_id, now).await?;
    let (summary, metrics) = refresh_derived(conn, &work, &assignments, config).await?;

    info!(
        work_id = %work_id,
        tag_id,
        tag = %updated.tag_name,
        prominence = %level,
        "Author set tag prominence"
    );

    Ok(OverrideOutcome {
        assignment: updated,
        summary,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tagrank_common::models::ProminenceRule;
    use uuid::Uuid;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn tag(tag_id: TagId, name: &str, tag_type: TagType) -> WorkTagAssignment {
        WorkTagAssignment {
            work_id: Uuid::nil(),
            tag_id,
            tag_name: name.to_string(),
            tag_type,
            prominence: Prominence::Unassigned,
            prominence_score: 0.0,
            auto_assigned: true,
            migration_batch: None,
            needs_review: false,
            created_at: at(tag_id),
        }
    }

    fn prominence_of(result: &[WorkTagAssignment], name: &str) -> Prominence {
        result.iter().find(|a| a.tag_name == name).unwrap().prominence
    }

    #[test]
    fn test_two_relationships_and_a_character() {
        let assignments = vec![
            tag(1, "A/B", TagType::Relationship),
            tag(2, "C/D", TagType::Relationship),
            tag(3, "E", TagType::Character),
        ];

        let result = classify(&assignments, 5000, &RuleSet::empty(1), &ClassifierConfig::default());

        assert_eq!(prominence_of(&result, "A/B"), Prominence::Primary);
        assert_eq!(prominence_of(&result, "C/D"), Prominence::Primary);
        assert_eq!(prominence_of(&result, "E"), Prominence::Secondary);
        assert_eq!(result[0].prominence_score, 1.0);
        assert_eq!(result[2].prominence_score, 0.6);
        assert!(result.iter().all(|a| a.migration_batch == Some(1)));
    }

    #[test]
    fn test_short_work_gets_no_primary() {
        let assignments = vec![tag(1, "A/B", TagType::Relationship)];
        let result = classify(&assignments, 200, &RuleSet::empty(1), &ClassifierConfig::default());
        assert_eq!(result[0].prominence, Prominence::Secondary);
    }

    #[test]
    fn test_many_relationships_are_secondary() {
        let assignments: Vec<_> = (1..=4)
            .map(|i| tag(i, &format!("R{}/S{}", i, i), TagType::Relationship))
            .collect();
        let result = classify(&assignments, 9000, &RuleSet::empty(1), &ClassifierConfig::default());
        assert!(result.iter().all(|a| a.prominence == Prominence::Secondary));
    }

    #[test]
    fn test_incidental_relationship_is_micro() {
        let assignments = vec![
            tag(1, "A/B", TagType::Relationship),
            tag(2, "Background C/D", TagType::Relationship),
        ];
        let result = classify(&assignments, 5000, &RuleSet::empty(1), &ClassifierConfig::default());
        assert_eq!(prominence_of(&result, "Background C/D"), Prominence::Micro);
        assert_eq!(result[1].prominence_score, 0.2);
    }

    #[test]
    fn test_cap_tie_break_prefers_reviewed_rules_then_age() {
        let rules = RuleSet::new(
            2,
            ["W/X", "Y/Z", "A/B", "C/D"].iter().map(|name| ProminenceRule {
                rule_version: 2,
                tag_name: name.to_string(),
                tag_type: TagType::Relationship,
                default_prominence: Prominence::Primary,
                min_word_threshold: 0,
                requires_manual_review: *name == "A/B",
            }),
        );
        // A/B is oldest but needs review; C/D and W/X share a timestamp
        let mut assignments = vec![
            tag(1, "A/B", TagType::Relationship),
            tag(2, "Y/Z", TagType::Relationship),
            tag(3, "W/X", TagType::Relationship),
            tag(4, "C/D", TagType::Relationship),
        ];
        assignments[3].created_at = assignments[2].created_at;

        let result = classify(&assignments, 5000, &rules, &ClassifierConfig::default());

        assert_eq!(prominence_of(&result, "Y/Z"), Prominence::Primary);
        assert_eq!(prominence_of(&result, "C/D"), Prominence::Primary);
        assert_eq!(prominence_of(&result, "W/X"), Prominence::Primary);
        assert_eq!(prominence_of(&result, "A/B"), Prominence::Secondary);
        // Review-flagged tags carry the confidence multiplier
        assert!((result[0].prominence_score - 0.48).abs() < 1e-9);
    }

    #[test]
    fn test_manual_tags_untouched_and_count_toward_cap() {
        let mut assignments = vec![
            tag(1, "M1/M2", TagType::Relationship),
            tag(2, "N1/N2", TagType::Relationship),
            tag(3, "A/B", TagType::Relationship),
        ];
        for manual in assignments.iter_mut().take(2) {
            manual.prominence = Prominence::Primary;
            manual.prominence_score = 1.0;
            manual.auto_assigned = false;
        }
        let config = ClassifierConfig {
            primary_relationship_cap: 2,
            ..ClassifierConfig::default()
        };

        let result = classify(&assignments, 5000, &RuleSet::empty(1), &config);

        assert_eq!(&result[..2], &assignments[..2]);
        assert_eq!(result[2].prominence, Prominence::Secondary);
    }

    #[test]
    fn test_tag_flood_gets_no_automatic_primary() {
        let mut assignments = vec![tag(1, "A/B", TagType::Relationship)];
        assignments.extend((2..=22).map(|i| tag(i, &format!("Freeform {}", i), TagType::Freeform)));

        let result = classify(&assignments, 100_000, &RuleSet::empty(1), &ClassifierConfig::default());
        assert_eq!(result[0].prominence, Prominence::Secondary);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let assignments = vec![
            tag(1, "A/B", TagType::Relationship),
            tag(2, "Side C/D", TagType::Relationship),
            tag(3, "Teen And Up Audiences", TagType::Rating),
            tag(4, "Fluff", TagType::Freeform),
        ];
        let rules = RuleSet::empty(3);
        let config = ClassifierConfig::default();

        let once = classify(&assignments, 2500, &rules, &config);
        let twice = classify(&once, 2500, &rules, &config);

        assert_eq!(once, twice);
        assert_eq!(prominence_of(&once, "Teen And Up Audiences"), Prominence::Micro);
    }
}
