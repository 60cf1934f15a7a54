pub mod aggregate;
pub mod args;
pub mod common;
pub mod config;
pub mod constants;
pub mod error;
pub mod features;
pub mod ingest;
pub mod labels;
pub mod model;
pub mod parquet_writer;
pub mod peers;
pub mod pipeline;
pub mod records;
pub mod report;
pub mod scoring;
