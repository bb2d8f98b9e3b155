//! Universe-family linker
//!
//! Family membership is stored as data: `universe_family_rules` rows map a
//! family name to fandom-name patterns for one rule version. Linking creates
//! the family tag and `parent_child` edges from it to every matching
//! canonical fandom. Re-running a version adds nothing new.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;
use tagrank_common::config::TaxonomyConfig;
use tagrank_common::{time, Error, Result, TagId, TagType};
use tracing::{debug, info};

use crate::works::find_or_create_tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    Contains,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Prefix => "prefix",
            MatchKind::Contains => "contains",
        }
    }
}

impl FromStr for MatchKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchKind::Exact),
            "prefix" => Ok(MatchKind::Prefix),
            "contains" => Ok(MatchKind::Contains),
            other => Err(Error::InvalidInput(format!("Unknown match kind: {}", other))),
        }
    }
}

/// One pattern assigning fandoms to a universe family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseFamilyRule {
    pub rule_version: i64,
    /// Family name without the configured suffix, e.g. "Marvel"
    pub family_name: String,
    pub match_kind: MatchKind,
    pub pattern: String,
}

impl UniverseFamilyRule {
    /// Case-insensitive match against a fandom name
    pub fn matches(&self, fandom_name: &str) -> bool {
        let name = fandom_name.to_lowercase();
        let pattern = self.pattern.to_lowercase();
        match self.match_kind {
            MatchKind::Exact => name == pattern,
            MatchKind::Prefix => name.starts_with(&pattern),
            MatchKind::Contains => name.contains(&pattern),
        }
    }
}

/// Outcome of one linking pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReport {
    pub families_created: usize,
    pub links_created: usize,
    pub fandoms_matched: usize,
}

pub async fn save_family_rule(conn: &mut SqliteConnection, rule: &UniverseFamilyRule) -> Result<()> {
    if rule.pattern.trim().is_empty() || rule.family_name.trim().is_empty() {
        return Err(Error::InvalidInput(
            "Universe family rules need a family name and a pattern".to_string(),
        ));
    }

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO universe_family_rules (rule_version, family_name, match_kind, pattern)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(rule.rule_version)
    .bind(&rule.family_name)
    .bind(rule.match_kind.as_str())
    .bind(&rule.pattern)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn load_family_rules(
    conn: &mut SqliteConnection,
    rule_version: i64,
) -> Result<Vec<UniverseFamilyRule>> {
    let rows = sqlx::query(
        r#"
        SELECT rule_version, family_name, match_kind, pattern
        FROM universe_family_rules
        WHERE rule_version = ?
        ORDER BY family_name, id
        "#,
    )
    .bind(rule_version)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            let match_kind: String = row.get("match_kind");
            Ok(UniverseFamilyRule {
                rule_version: row.get("rule_version"),
                family_name: row.get("family_name"),
                match_kind: match_kind.parse()?,
                pattern: row.get("pattern"),
            })
        })
        .collect()
}

/// Create family tags and link matching canonical fandoms for one rule version
pub async fn link_universe_families(
    conn: &mut SqliteConnection,
    rule_version: i64,
    config: &TaxonomyConfig,
) -> Result<LinkReport> {
    let rules = load_family_rules(conn, rule_version).await?;
    let mut report = LinkReport::default();
    if rules.is_empty() {
        info!(rule_version, "No universe family rules for version");
        return Ok(report);
    }

    let suffix = config.universe_family_suffix.to_lowercase();
    let fandoms: Vec<(TagId, String)> = sqlx::query(
        "SELECT id, name FROM tags WHERE type = 'fandom' AND is_canonical = 1 ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(|row| (row.get("id"), row.get("name")))
    .filter(|(_, name): &(TagId, String)| !name.to_lowercase().ends_with(&suffix))
    .collect();

    let mut family_names: Vec<&str> = rules.iter().map(|r| r.family_name.as_str()).collect();
    family_names.dedup();

    let now = time::now();
    let mut matched = std::collections::HashSet::new();

    for family_name in family_names {
        let family_tag = format!("{}{}", family_name, config.universe_family_suffix);
        let existed: Option<TagId> = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
            .bind(&family_tag)
            .fetch_optional(&mut *conn)
            .await?;
        let family_id = find_or_create_tag(conn, &family_tag, TagType::Fandom, now).await?;
        if existed.is_none() {
            report.families_created += 1;
        }

        let family_rules: Vec<&UniverseFamilyRule> =
            rules.iter().filter(|r| r.family_name == family_name).collect();

        for (fandom_id, fandom_name) in &fandoms {
            if !family_rules.iter().any(|r| r.matches(fandom_name)) {
                continue;
            }
            matched.insert(*fandom_id);

            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO tag_relationships
                    (parent_tag_id, child_tag_id, relationship_type, created_at)
                VALUES (?, ?, 'parent_child', ?)
                "#,
            )
            .bind(family_id)
            .bind(fandom_id)
            .bind(time::to_db(now))
            .execute(&mut *conn)
            .await?;

            if inserted.rows_affected() > 0 {
                report.links_created += 1;
                debug!(family = %family_tag, fandom = %fandom_name, "Linked fandom to universe family");
            }
        }
    }

    report.fandoms_matched = matched.len();
    info!(
        rule_version,
        families_created = report.families_created,
        links_created = report.links_created,
        fandoms_matched = report.fandoms_matched,
        "Linked universe families"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::Taxonomy;
    use tagrank_common::db::init_memory_database;

    fn rule(family: &str, kind: MatchKind, pattern: &str) -> UniverseFamilyRule {
        UniverseFamilyRule {
            rule_version: 1,
            family_name: family.to_string(),
            match_kind: kind,
            pattern: pattern.to_string(),
        }
    }

    #[test]
    fn test_match_kinds_ignore_case() {
        assert!(rule("Marvel", MatchKind::Contains, "marvel").matches("Marvel Cinematic Universe"));
        assert!(rule("Marvel", MatchKind::Prefix, "thor").matches("Thor (Movies)"));
        assert!(!rule("Marvel", MatchKind::Prefix, "thor").matches("The Mighty Thor"));
        assert!(rule("DC", MatchKind::Exact, "DC Comics").matches("dc comics"));
        assert!(!rule("DC", MatchKind::Exact, "DC Comics").matches("DC Comics (2011)"));
    }

    #[tokio::test]
    async fn test_linking_is_idempotent_and_resolvable() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let now = time::now();
        let config = TaxonomyConfig::default();

        let mcu = find_or_create_tag(&mut conn, "Marvel Cinematic Universe", TagType::Fandom, now)
            .await
            .unwrap();
        let thor = find_or_create_tag(&mut conn, "Thor (Movies)", TagType::Fandom, now)
            .await
            .unwrap();
        let hp = find_or_create_tag(&mut conn, "Harry Potter - J. K. Rowling", TagType::Fandom, now)
            .await
            .unwrap();

        save_family_rule(&mut conn, &rule("Marvel", MatchKind::Contains, "marvel")).await.unwrap();
        save_family_rule(&mut conn, &rule("Marvel", MatchKind::Prefix, "thor")).await.unwrap();

        let first = link_universe_families(&mut conn, 1, &config).await.unwrap();
        assert_eq!(first.families_created, 1);
        assert_eq!(first.links_created, 2);
        assert_eq!(first.fandoms_matched, 2);

        let second = link_universe_families(&mut conn, 1, &config).await.unwrap();
        assert_eq!(second.families_created, 0);
        assert_eq!(second.links_created, 0);

        let taxonomy = Taxonomy::load_neighborhood(&mut conn, &[mcu, thor, hp], &config)
            .await
            .unwrap();
        let family = taxonomy.universe_family_of(mcu).unwrap();
        assert_eq!(taxonomy.universe_family_of(thor), Some(family));
        assert_eq!(taxonomy.universe_family_of(hp), None);
        assert_eq!(taxonomy.tag(family).unwrap().name, "Marvel Universe Family");
        assert!(taxonomy.pair_is_crossover(&[mcu], &[thor]));
    }

    #[tokio::test]
    async fn test_unknown_version_links_nothing() {
        let pool = init_memory_database().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let report = link_universe_families(&mut conn, 42, &TaxonomyConfig::default())
            .await
            .unwrap();
        assert_eq!(report, LinkReport::default());
    }
}
