//! Artifact storage service with token-gated presigned access.
//!
//! Clients upload artifacts, then share time-, usage- and network-limited
//! access through bearer tokens. Redeeming a token yields a short-lived
//! presigned URL against the object store. Presigned uploads are tracked as
//! `PENDING` until a completion call or the background reconciler confirms
//! the bytes landed.

pub mod audit;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod object_store;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

pub use state::{AppState, HttpSettings};
