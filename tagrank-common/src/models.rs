//! Domain models shared by the engine and the HTTP layer
//!
//! Field names are the external contract: they are serialized verbatim
//! (snake_case) to the search index and over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Work identifier (supplied by the host application)
pub type WorkId = Uuid;

/// Tag identifier (taxonomy row id)
pub type TagId = i64;

/// Tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    Fandom,
    Character,
    Relationship,
    Freeform,
    Rating,
    Warning,
    Category,
    Additional,
}

impl TagType {
    pub const ALL: [TagType; 8] = [
        TagType::Fandom,
        TagType::Character,
        TagType::Relationship,
        TagType::Freeform,
        TagType::Rating,
        TagType::Warning,
        TagType::Category,
        TagType::Additional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagType::Fandom => "fandom",
            TagType::Character => "character",
            TagType::Relationship => "relationship",
            TagType::Freeform => "freeform",
            TagType::Rating => "rating",
            TagType::Warning => "warning",
            TagType::Category => "category",
            TagType::Additional => "additional",
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown tag type: {}", s)))
    }
}

/// Editorial weight of a tag on a work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Prominence {
    Primary,
    Secondary,
    Micro,
    #[default]
    Unassigned,
}

impl Prominence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prominence::Primary => "primary",
            Prominence::Secondary => "secondary",
            Prominence::Micro => "micro",
            Prominence::Unassigned => "unassigned",
        }
    }

    /// Primary and secondary tags describe what the work is about
    pub fn is_major(&self) -> bool {
        matches!(self, Prominence::Primary | Prominence::Secondary)
    }
}

impl fmt::Display for Prominence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Prominence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Prominence::Primary),
            "secondary" => Ok(Prominence::Secondary),
            "micro" => Ok(Prominence::Micro),
            "unassigned" => Ok(Prominence::Unassigned),
            other => Err(Error::InvalidInput(format!("Unknown prominence: {}", other))),
        }
    }
}

/// Taxonomy edge kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    ParentChild,
    Synonym,
    Related,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::ParentChild => "parent_child",
            RelationshipType::Synonym => "synonym",
            RelationshipType::Related => "related",
        }
    }
}

impl FromStr for RelationshipType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent_child" => Ok(RelationshipType::ParentChild),
            "synonym" => Ok(RelationshipType::Synonym),
            "related" => Ok(RelationshipType::Related),
            other => Err(Error::InvalidInput(format!("Unknown relationship type: {}", other))),
        }
    }
}

/// Canonical tag entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    pub is_canonical: bool,
    /// Set iff `is_canonical` is false
    pub canonical_name: Option<String>,
    pub use_count: i64,
}

/// Directed taxonomy edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRelationship {
    pub parent_tag_id: TagId,
    pub child_tag_id: TagId,
    pub relationship_type: RelationshipType,
}

/// One tag attached to one work, with its mutable classification state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkTagAssignment {
    pub work_id: WorkId,
    pub tag_id: TagId,
    pub tag_name: String,
    pub tag_type: TagType,
    pub prominence: Prominence,
    pub prominence_score: f64,
    pub auto_assigned: bool,
    pub migration_batch: Option<i64>,
    /// Classifier flagged this tag for author review (rule requested it)
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
}

/// Denormalized per-work counters, always recomputable from assignments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkTagSummary {
    pub work_id: WorkId,
    pub primary_relationship_count: i64,
    pub secondary_relationship_count: i64,
    pub micro_relationship_count: i64,
    /// All relationship tags, including unassigned ones
    pub relationship_tag_count: i64,
    /// Tags of any type that are primary or secondary
    pub major_tag_count: i64,
    pub total_tag_count: i64,
    pub auto_assigned_count: i64,
    pub needs_author_review: bool,
}

/// Derived abuse/quality signals for a work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkTagMetrics {
    pub work_id: WorkId,
    pub tags_per_1k_words: f64,
    pub relationship_tag_ratio: f64,
    pub unique_fandom_count: i64,
    pub potential_tag_spam: bool,
    /// Fandoms span two or more universe families
    pub is_crossover: bool,
}

/// Static reference data consulted by the classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProminenceRule {
    pub rule_version: i64,
    pub tag_name: String,
    pub tag_type: TagType,
    pub default_prominence: Prominence,
    pub min_word_threshold: i64,
    pub requires_manual_review: bool,
}

/// Engagement counters supplied by the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngagementCounters {
    pub hits: i64,
    pub kudos_count: i64,
    pub comment_count: i64,
    pub bookmark_count: i64,
}

/// Work metadata contract consumed on create/update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkInput {
    pub id: WorkId,
    pub word_count: i64,
    #[serde(default)]
    pub fandom_tags: Vec<String>,
    #[serde(default)]
    pub character_tags: Vec<String>,
    #[serde(default)]
    pub relationship_tags: Vec<String>,
    #[serde(default)]
    pub freeform_tags: Vec<String>,
    #[serde(default)]
    pub rating_tags: Vec<String>,
    #[serde(default)]
    pub warning_tags: Vec<String>,
    #[serde(default)]
    pub category_tags: Vec<String>,
    #[serde(default)]
    pub additional_tags: Vec<String>,
}

impl WorkInput {
    /// All (type, name) pairs in declaration order, trimmed, empty names dropped
    pub fn typed_tags(&self) -> Vec<(TagType, String)> {
        let groups: [(TagType, &Vec<String>); 8] = [
            (TagType::Fandom, &self.fandom_tags),
            (TagType::Character, &self.character_tags),
            (TagType::Relationship, &self.relationship_tags),
            (TagType::Freeform, &self.freeform_tags),
            (TagType::Rating, &self.rating_tags),
            (TagType::Warning, &self.warning_tags),
            (TagType::Category, &self.category_tags),
            (TagType::Additional, &self.additional_tags),
        ];

        groups
            .iter()
            .flat_map(|(tag_type, names)| {
                names
                    .iter()
                    .map(|n| n.trim())
                    .filter(|n| !n.is_empty())
                    .map(move |n| (*tag_type, n.to_string()))
            })
            .collect()
    }
}

/// Composite ranking scores, integer-bucketed to [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RankingScores {
    pub quality_score: u8,
    pub engagement_rate: u8,
    pub comment_quality: u8,
    pub discovery_boost: u8,
}
