//! ntl_cloud: deployment dashboard backend
//!
//! Users register, upload a site (or point at a repository) under a domain,
//! and a background monitor walks each deployment through
//! `building -> deploying -> live | error` against a hosting provider.
//!
//! This lib exposes the store, the lifecycle monitor and the REST router;
//! the `ntl_cloud` binary serves them and `ntl` is the command-line client.

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
// Lifecycle driver: one polling task per in-flight deployment
pub mod monitor;
pub mod packaging;
pub mod provider;
// REST API module: Axum HTTP handlers under /api
pub mod rest;
pub mod storage;
