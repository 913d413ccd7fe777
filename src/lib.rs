pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod interpret;
pub mod logging;
pub mod normalizer;
pub mod output;
pub mod parse;
pub mod raw;
pub mod schema;
pub mod source;
