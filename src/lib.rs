//! ScoutFeed Backend Library
//!
//! Catalog feed ingestion and product resolution: scheduled FTP/SFTP feed
//! pulls, CSV parsing, canonical product identity resolution with replayable
//! evidence, and the queue/sweeper machinery around it.

pub mod admin;
pub mod api;
pub mod feeds;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod resolver;
pub mod runlog;
pub mod store;
