pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod runner;
pub mod sampling;
pub mod tokenizer;
