//! HTTP API Module
//!
//! Provides the REST API and the HA admission filter in front of it.

pub mod admission;
mod http;

pub use http::{AppState, HaNodesResponse, HttpServer};
