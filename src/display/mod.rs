//! Terminal rendering for the CLI: progress bars and result tables.

pub mod progress;
pub mod tables;

pub use progress::{BuildProgress, create_progress_bar};
pub use tables::{TableBuilder, create_cluster_table, create_projection_table, create_search_table};
