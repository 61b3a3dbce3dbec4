pub mod broker;
pub mod config;
pub mod correlator;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod query;
pub mod rest;
pub mod store;
pub mod validate;
