pub mod api;
pub mod collect;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod models;
pub mod probe;
pub mod recorder;
pub mod report;
pub mod workflow;
