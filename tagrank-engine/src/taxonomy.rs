//! Taxonomy & crossover resolver
//!
//! Works on an in-memory slice of the tag graph: the tags of interest plus
//! their synonym and parent_child ancestors up to the configured depth.
//! Universe-family lookups walk parent_child edges breadth-first. A cycle
//! found on the walk is logged and the lookup resolves to "unknown", which
//! in turn means "no crossover".

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{BTreeSet, HashMap, HashSet};
use tagrank_common::config::TaxonomyConfig;
use tagrank_common::models::{RelationshipType, Tag, TagRelationship};
use tagrank_common::{Error, Result, TagId};
use tracing::warn;

/// Universe a fandom belongs to for crossover purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Universe {
    /// Fandom sits under a universe-family tag
    Family(TagId),
    /// Fandom without a family is its own universe (canonical tag id)
    Standalone(TagId),
}

/// Loaded portion of the tag taxonomy
#[derive(Debug, Clone)]
pub struct Taxonomy {
    tags: HashMap<TagId, Tag>,
    by_name: HashMap<String, TagId>,
    /// child → parents over parent_child edges
    parents: HashMap<TagId, Vec<TagId>>,
    /// synonym child → canonical parent
    synonym_of: HashMap<TagId, TagId>,
    family_suffix: String,
    max_depth: usize,
}

impl Taxonomy {
    pub fn from_parts(
        tags: impl IntoIterator<Item = Tag>,
        edges: impl IntoIterator<Item = TagRelationship>,
        config: &TaxonomyConfig,
    ) -> Self {
        let mut taxonomy = Self {
            tags: HashMap::new(),
            by_name: HashMap::new(),
            parents: HashMap::new(),
            synonym_of: HashMap::new(),
            family_suffix: config.universe_family_suffix.to_lowercase(),
            max_depth: config.max_ancestor_depth,
        };
        for tag in tags {
            taxonomy.insert_tag(tag);
        }
        for edge in edges {
            taxonomy.insert_edge(edge);
        }
        taxonomy
    }

    fn insert_tag(&mut self, tag: Tag) {
        self.by_name.insert(tag.name.to_lowercase(), tag.id);
        self.tags.insert(tag.id, tag);
    }

    fn insert_edge(&mut self, edge: TagRelationship) {
        if edge.parent_tag_id == edge.child_tag_id {
            return;
        }
        match edge.relationship_type {
            RelationshipType::ParentChild => {
                let parents = self.parents.entry(edge.child_tag_id).or_default();
                if !parents.contains(&edge.parent_tag_id) {
                    parents.push(edge.parent_tag_id);
                    parents.sort_unstable();
                }
            }
            RelationshipType::Synonym => {
                self.synonym_of.entry(edge.child_tag_id).or_insert(edge.parent_tag_id);
            }
            RelationshipType::Related => {}
        }
    }

    /// Load `seeds`, their canonical forms and ancestors up to the walk depth
    pub async fn load_neighborhood(
        conn: &mut SqliteConnection,
        seeds: &[TagId],
        config: &TaxonomyConfig,
    ) -> Result<Self> {
        let mut taxonomy = Self::from_parts(Vec::new(), Vec::new(), config);
        if seeds.is_empty() {
            return Ok(taxonomy);
        }

        let mut frontier: Vec<TagId> = seeds.to_vec();
        for tag in fetch_tags_by_id(conn, &frontier).await? {
            taxonomy.insert_tag(tag);
        }

        // Non-canonical tags name their canonical form directly
        let canonical_names: Vec<String> = taxonomy
            .tags
            .values()
            .filter_map(|t| t.canonical_name.clone())
            .collect();
        for tag in fetch_tags_by_name(conn, &canonical_names).await? {
            frontier.push(tag.id);
            taxonomy.insert_tag(tag);
        }

        // One extra hop covers the synonym step before the parent_child walk
        let mut visited: HashSet<TagId> = frontier.iter().copied().collect();
        for _ in 0..=config.max_ancestor_depth {
            if frontier.is_empty() {
                break;
            }
            let edges = fetch_parent_edges(conn, &frontier).await?;
            let mut next = Vec::new();
            for edge in &edges {
                if visited.insert(edge.parent_tag_id) {
                    next.push(edge.parent_tag_id);
                }
            }
            for tag in fetch_tags_by_id(conn, &next).await? {
                taxonomy.insert_tag(tag);
            }
            for edge in edges {
                taxonomy.insert_edge(edge);
            }
            frontier = next;
        }

        Ok(taxonomy)
    }

    pub fn tag(&self, tag_id: TagId) -> Option<&Tag> {
        self.tags.get(&tag_id)
    }

    /// Canonical form of a tag (itself when canonical or unknown)
    pub fn canonical_of(&self, tag_id: TagId) -> TagId {
        if let Some(tag) = self.tags.get(&tag_id) {
            if let Some(name) = &tag.canonical_name {
                if let Some(id) = self.by_name.get(&name.to_lowercase()) {
                    return *id;
                }
            }
        }
        self.synonym_of.get(&tag_id).copied().unwrap_or(tag_id)
    }

    fn is_family(&self, tag_id: TagId) -> bool {
        self.tags
            .get(&tag_id)
            .map(|t| t.name.to_lowercase().ends_with(&self.family_suffix))
            .unwrap_or(false)
    }

    /// Nearest universe-family ancestor, failing on a cycle
    ///
    /// When several families sit at the same depth the lowest tag id wins.
    pub fn try_universe_family_of(&self, tag_id: TagId) -> Result<Option<TagId>> {
        let start = self.canonical_of(tag_id);
        if self.is_family(start) {
            return Ok(Some(start));
        }

        let mut frontier: Vec<(TagId, Vec<TagId>)> = vec![(start, vec![start])];
        for _ in 0..self.max_depth {
            let mut found: Vec<TagId> = Vec::new();
            let mut next = Vec::new();

            for (node, path) in &frontier {
                for parent in self.parents.get(node).into_iter().flatten() {
                    if path.contains(parent) {
                        return Err(Error::InconsistentTaxonomy(format!(
                            "cycle through tag {} while resolving universe family of tag {}",
                            parent, tag_id
                        )));
                    }
                    if self.is_family(*parent) {
                        found.push(*parent);
                    } else {
                        let mut extended = path.clone();
                        extended.push(*parent);
                        next.push((*parent, extended));
                    }
                }
            }

            if let Some(family) = found.into_iter().min() {
                return Ok(Some(family));
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        Ok(None)
    }

    /// Nearest universe family; cycles are logged and resolve to `None`
    pub fn universe_family_of(&self, tag_id: TagId) -> Option<TagId> {
        match self.try_universe_family_of(tag_id) {
            Ok(family) => family,
            Err(e) => {
                warn!(tag_id, error = %e, "Universe family resolution skipped");
                None
            }
        }
    }

    fn universes(&self, fandoms: &[TagId]) -> Result<BTreeSet<Universe>> {
        fandoms
            .iter()
            .map(|id| {
                Ok(match self.try_universe_family_of(*id)? {
                    Some(family) => Universe::Family(family),
                    None => Universe::Standalone(self.canonical_of(*id)),
                })
            })
            .collect()
    }

    /// Distinct canonical fandoms
    pub fn canonical_set(&self, fandoms: &[TagId]) -> BTreeSet<TagId> {
        fandoms.iter().map(|id| self.canonical_of(*id)).collect()
    }

    /// A single work spans two or more universes
    ///
    /// A fandom with no family counts as its own universe.
    pub fn work_is_crossover(&self, fandoms: &[TagId]) -> bool {
        match self.universes(fandoms) {
            Ok(universes) => universes.len() >= 2,
            Err(e) => {
                warn!(error = %e, "Crossover check short-circuited");
                false
            }
        }
    }

    /// Crossover between two works' fandom sets
    ///
    /// True when the works share no canonical fandom yet share a universe
    /// family, or when either work alone carries fandoms from two or more
    /// distinct universe families.
    pub fn pair_is_crossover(&self, fandoms_a: &[TagId], fandoms_b: &[TagId]) -> bool {
        match self.try_pair_is_crossover(fandoms_a, fandoms_b) {
            Ok(crossover) => crossover,
            Err(e) => {
                warn!(error = %e, "Crossover check short-circuited");
                false
            }
        }
    }

    fn try_pair_is_crossover(&self, fandoms_a: &[TagId], fandoms_b: &[TagId]) -> Result<bool> {
        let universes_a = self.universes(fandoms_a)?;
        let universes_b = self.universes(fandoms_b)?;
        let families = |set: &BTreeSet<Universe>| -> BTreeSet<TagId> {
            set.iter()
                .filter_map(|u| match u {
                    Universe::Family(id) => Some(*id),
                    Universe::Standalone(_) => None,
                })
                .collect()
        };
        let families_a = families(&universes_a);
        let families_b = families(&universes_b);

        let shares_fandom = !self
            .canonical_set(fandoms_a)
            .is_disjoint(&self.canonical_set(fandoms_b));
        let shares_family = !families_a.is_disjoint(&families_b);

        Ok((!shares_fandom && shares_family) || families_a.len() >= 2 || families_b.len() >= 2)
    }
}

fn tag_from_row(row: &SqliteRow) -> Result<Tag> {
    let tag_type: String = row.get("type");
    Ok(Tag {
        id: row.get("id"),
        name: row.get("name"),
        tag_type: tag_type.parse()?,
        is_canonical: row.get::<i64, _>("is_canonical") != 0,
        canonical_name: row.get("canonical_name"),
        use_count: row.get("use_count"),
    })
}

async fn fetch_tags_by_id(conn: &mut SqliteConnection, ids: &[TagId]) -> Result<Vec<Tag>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT id, name, type, is_canonical, canonical_name, use_count FROM tags WHERE id IN (",
    );
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(tag_from_row).collect()
}

async fn fetch_tags_by_name(conn: &mut SqliteConnection, names: &[String]) -> Result<Vec<Tag>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT id, name, type, is_canonical, canonical_name, use_count FROM tags WHERE name IN (",
    );
    let mut separated = qb.separated(", ");
    for name in names {
        separated.push_bind(name.clone());
    }
    separated.push_unseparated(")");

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(tag_from_row).collect()
}

async fn fetch_parent_edges(
    conn: &mut SqliteConnection,
    children: &[TagId],
) -> Result<Vec<TagRelationship>> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT parent_tag_id, child_tag_id, relationship_type FROM tag_relationships \
         WHERE relationship_type IN ('parent_child', 'synonym') AND child_tag_id IN (",
    );
    let mut separated = qb.separated(", ");
    for id in children {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") ORDER BY parent_tag_id");

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            let relationship_type: String = row.get("relationship_type");
            Ok(TagRelationship {
                parent_tag_id: row.get("parent_tag_id"),
                child_tag_id: row.get("child_tag_id"),
                relationship_type: relationship_type.parse()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagrank_common::TagType;

    fn fandom(id: TagId, name: &str) -> Tag {
        Tag {
            id,
            name: name.to_string(),
            tag_type: TagType::Fandom,
            is_canonical: true,
            canonical_name: None,
            use_count: 0,
        }
    }

    fn edge(parent: TagId, child: TagId, relationship_type: RelationshipType) -> TagRelationship {
        TagRelationship { parent_tag_id: parent, child_tag_id: child, relationship_type }
    }

    /// Marvel family (100) over MCU (1) and Thor (2); DC family (200) over
    /// Batman (3); Harry Potter (4) standalone with synonym "HP" (5).
    fn sample() -> Taxonomy {
        let tags = vec![
            fandom(100, "Marvel Universe Family"),
            fandom(200, "DC Universe Family"),
            fandom(1, "Marvel Cinematic Universe"),
            fandom(2, "Thor (Movies)"),
            fandom(3, "Batman - All Media Types"),
            fandom(4, "Harry Potter - J. K. Rowling"),
            Tag {
                is_canonical: false,
                canonical_name: Some("Harry Potter - J. K. Rowling".to_string()),
                ..fandom(5, "HP")
            },
        ];
        let edges = vec![
            edge(100, 1, RelationshipType::ParentChild),
            edge(100, 2, RelationshipType::ParentChild),
            edge(200, 3, RelationshipType::ParentChild),
        ];
        Taxonomy::from_parts(tags, edges, &TaxonomyConfig::default())
    }

    #[test]
    fn test_universe_family_of_direct_parent() {
        let taxonomy = sample();
        assert_eq!(taxonomy.universe_family_of(1), Some(100));
        assert_eq!(taxonomy.universe_family_of(3), Some(200));
        assert_eq!(taxonomy.universe_family_of(4), None);
    }

    #[test]
    fn test_synonym_resolves_to_canonical() {
        let taxonomy = sample();
        assert_eq!(taxonomy.canonical_of(5), 4);
        assert_eq!(taxonomy.canonical_set(&[4, 5]).len(), 1);
    }

    #[test]
    fn test_pair_sharing_family_but_not_fandom_is_crossover() {
        let taxonomy = sample();
        assert!(taxonomy.pair_is_crossover(&[1], &[2]));
        // Same fandom on both sides is not a crossover
        assert!(!taxonomy.pair_is_crossover(&[1], &[1]));
        // Unrelated standalone fandoms
        assert!(!taxonomy.pair_is_crossover(&[4], &[3]));
    }

    #[test]
    fn test_single_work_spanning_two_families() {
        let taxonomy = sample();
        assert!(taxonomy.work_is_crossover(&[1, 3]));
        assert!(taxonomy.pair_is_crossover(&[1, 3], &[4]));
        assert!(!taxonomy.work_is_crossover(&[1, 2]));
        // A standalone fandom counts as its own universe
        assert!(taxonomy.work_is_crossover(&[1, 4]));
        assert!(!taxonomy.work_is_crossover(&[4, 5]));
    }

    #[test]
    fn test_cycle_is_rejected_not_looped() {
        let tags = vec![fandom(1, "A"), fandom(2, "B")];
        let edges = vec![
            edge(2, 1, RelationshipType::ParentChild),
            edge(1, 2, RelationshipType::ParentChild),
        ];
        let taxonomy = Taxonomy::from_parts(tags, edges, &TaxonomyConfig::default());

        assert!(matches!(
            taxonomy.try_universe_family_of(1),
            Err(Error::InconsistentTaxonomy(_))
        ));
        assert_eq!(taxonomy.universe_family_of(1), None);
        assert!(!taxonomy.work_is_crossover(&[1, 2]));
    }

    #[test]
    fn test_family_beyond_depth_not_found() {
        let tags = vec![
            fandom(1, "Leaf"),
            fandom(2, "Mid"),
            fandom(3, "Upper"),
            fandom(4, "Far Universe Family"),
        ];
        let edges = vec![
            edge(2, 1, RelationshipType::ParentChild),
            edge(3, 2, RelationshipType::ParentChild),
            edge(4, 3, RelationshipType::ParentChild),
        ];
        let taxonomy = Taxonomy::from_parts(tags, edges, &TaxonomyConfig::default());

        assert_eq!(taxonomy.universe_family_of(2), Some(4));
        assert_eq!(taxonomy.universe_family_of(1), None);
    }
}
