//! Core data models for the artifact service.
//!
//! These entities map to the `artifacts` and `tokens` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod artifact;
pub mod token;

pub use artifact::{Artifact, ArtifactStatus};
pub use token::{Token, TokenConstraints, TokenGrant, TokenKind};
