//! vectordb: a multi-tenant vector database service.
//!
//! Modular stack for storage (Sled + Arrow), indexing (instant-distance
//! HNSW, flat, and IVF), hybrid vector + lexical search, and networking
//! (Axum REST and Tonic gRPC) over a shared `Service`.

pub mod backup;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod hybrid;
pub mod indexing;
pub mod ingest;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod query;
pub mod rate_limit;
pub mod rest;
pub mod rpc;
pub mod service;
pub mod storage;
pub mod tenant;
