//! Prominence rule table
//!
//! Rules are versioned reference data keyed by `(rule_version, tag_name,
//! tag_type)`. The classifier receives a loaded [`RuleSet`] for one explicit
//! version; nothing here tracks a "current" version.

use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use tagrank_common::models::ProminenceRule;
use tagrank_common::{Prominence, Result, TagType};
use tracing::debug;

/// Rules for one rule version, indexed by lowercase name and type
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    version: i64,
    rules: HashMap<(String, TagType), ProminenceRule>,
}

impl RuleSet {
    pub fn new(version: i64, rules: impl IntoIterator<Item = ProminenceRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| ((rule.tag_name.to_lowercase(), rule.tag_type), rule))
            .collect();
        Self { version, rules }
    }

    /// Rule set with no named rules; type-level defaults apply to every tag
    pub fn empty(version: i64) -> Self {
        Self::new(version, Vec::new())
    }

    /// Load every rule stored for `version`
    pub async fn load(conn: &mut SqliteConnection, version: i64) -> Result<Self> {
        let rows = sqlx::query(
            r#"
            SELECT rule_version, tag_name, tag_type, default_prominence,
                   min_word_threshold, requires_manual_review
            FROM tag_prominence_rules
            WHERE rule_version = ?
            "#,
        )
        .bind(version)
        .fetch_all(&mut *conn)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let tag_type: String = row.get("tag_type");
            let default_prominence: String = row.get("default_prominence");
            rules.push(ProminenceRule {
                rule_version: row.get("rule_version"),
                tag_name: row.get("tag_name"),
                tag_type: tag_type.parse()?,
                default_prominence: default_prominence.parse()?,
                min_word_threshold: row.get("min_word_threshold"),
                requires_manual_review: row.get::<i64, _>("requires_manual_review") != 0,
            });
        }

        debug!(rule_version = version, rules = rules.len(), "Loaded prominence rules");
        Ok(Self::new(version, rules))
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Rule for a tag, matched case-insensitively on name and exactly on type
    pub fn lookup(&self, tag_name: &str, tag_type: TagType) -> Option<&ProminenceRule> {
        self.rules.get(&(tag_name.to_lowercase(), tag_type))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Insert or replace one rule
pub async fn save_rule(conn: &mut SqliteConnection, rule: &ProminenceRule) -> Result<()> {
    if rule.default_prominence == Prominence::Unassigned {
        return Err(tagrank_common::Error::InvalidInput(format!(
            "Rule for '{}' must name a concrete prominence",
            rule.tag_name
        )));
    }

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO tag_prominence_rules
            (rule_version, tag_name, tag_type, default_prominence, min_word_threshold, requires_manual_review)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rule.rule_version)
    .bind(&rule.tag_name)
    .bind(rule.tag_type.as_str())
    .bind(rule.default_prominence.as_str())
    .bind(rule.min_word_threshold)
    .bind(rule.requires_manual_review as i64)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Highest rule version present in the rule table
pub async fn latest_rule_version(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(rule_version) FROM tag_prominence_rules")
        .fetch_one(&mut *conn)
        .await?;
    Ok(version)
}

/// True when a word of the tag name is one of the incidental markers
///
/// Matching is on whole words, so "Outside/Inside" does not match "side".
pub fn is_incidental(tag_name: &str, markers: &[String]) -> bool {
    tag_name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .any(|word| markers.iter().any(|m| m.eq_ignore_ascii_case(word)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagrank_common::config::ClassifierConfig;
    use tagrank_common::db::init_memory_database;

    fn rule(version: i64, name: &str, prominence: Prominence) -> ProminenceRule {
        ProminenceRule {
            rule_version: version,
            tag_name: name.to_string(),
            tag_type: TagType::Relationship,
            default_prominence: prominence,
            min_word_threshold: 1000,
            requires_manual_review: false,
        }
    }

    #[test]
    fn test_lookup_ignores_case_but_not_type() {
        let rules = RuleSet::new(1, vec![rule(1, "Harry Potter/Draco Malfoy", Prominence::Primary)]);

        assert!(rules.lookup("harry potter/draco malfoy", TagType::Relationship).is_some());
        assert!(rules.lookup("Harry Potter/Draco Malfoy", TagType::Character).is_none());
    }

    #[test]
    fn test_incidental_markers_match_whole_words() {
        let markers = ClassifierConfig::default().incidental_markers;

        assert!(is_incidental("Background Harry/Ginny", &markers));
        assert!(is_incidental("Past Sirius Black/Remus Lupin", &markers));
        assert!(is_incidental("Implied/Referenced Character Death", &markers));
        assert!(!is_incidental("Outside/Inside", &markers));
        assert!(!is_incidental("Pastry Chef/Baker", &markers));
    }

    #[tokio::test]
    async fn test_load_only_requested_version() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        save_rule(&mut conn, &rule(1, "A/B", Prominence::Primary)).await.unwrap();
        save_rule(&mut conn, &rule(2, "A/B", Prominence::Micro)).await.unwrap();
        save_rule(&mut conn, &rule(2, "C/D", Prominence::Secondary)).await.unwrap();

        let v1 = RuleSet::load(&mut conn, 1).await.unwrap();
        let v2 = RuleSet::load(&mut conn, 2).await.unwrap();

        assert_eq!(v1.len(), 1);
        assert_eq!(v2.len(), 2);
        assert_eq!(
            v2.lookup("a/b", TagType::Relationship).unwrap().default_prominence,
            Prominence::Micro
        );
        assert_eq!(latest_rule_version(&mut conn).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_unassigned_rule_rejected() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let result = save_rule(&mut conn, &rule(1, "A/B", Prominence::Unassigned)).await;
        assert!(result.is_err());
    }
}
