//! Ringmark: background synchronization engine for a decentralized
//! tagging/bookmarking client. Owns session lifecycle, durably queues and
//! retries outbound publications, and maintains a deduplicated, filtered
//! feed cache per URL.

pub mod config;
pub mod db;
pub mod engine;
pub mod feed;
pub mod gateway;
pub mod model;
pub mod queue;
pub mod session;
