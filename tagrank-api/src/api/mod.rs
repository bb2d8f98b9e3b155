//! HTTP API handlers for tagrank-api

pub mod batches;
pub mod crossover;
pub mod health;
pub mod prominence;
pub mod search;
pub mod works;

pub use batches::batch_routes;
pub use crossover::crossover_routes;
pub use health::health_routes;
pub use prominence::prominence_routes;
pub use search::search_routes;
pub use works::work_routes;
