//! tagrank-engine library
//!
//! Tag prominence classification, tag metrics, taxonomy and crossover
//! resolution, anti-gaming ranking, and the migration batch runner.

pub mod batch;
pub mod cache;
pub mod classifier;
pub mod engine;
pub mod families;
pub mod filter;
pub mod metrics;
pub mod publish;
pub mod ranking;
pub mod retry;
pub mod rules;
pub mod search;
pub mod summary;
pub mod taxonomy;
pub mod works;

pub use batch::{BatchResult, BatchRunner, BatchStatus, MigrationBatch};
pub use classifier::{ClassifyOutcome, OverrideOutcome};
pub use engine::TagEngine;
pub use filter::{RelationshipBucket, SearchFilter};
pub use publish::{HttpSearchIndex, InMemorySearchIndex, Publisher, ScoreDocument, SearchIndex};
pub use ranking::{RankedWork, SortField, SortOrder};
pub use rules::RuleSet;
pub use search::{SearchQuery, SearchResults};
pub use taxonomy::Taxonomy;
