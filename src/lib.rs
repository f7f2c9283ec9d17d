//! Sentiment Engine: feedback scoring pipeline core.

pub mod analytics;
pub mod clock;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod worker;
