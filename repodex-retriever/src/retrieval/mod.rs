pub mod analyzer;
pub mod chunking_strategy;
pub mod file_tree;
pub mod indexing_engine;
pub mod progress;
pub mod query;
