//! Token issuance and redemption.
//!
//! Redemption checks run in a fixed order and the first violated constraint
//! is reported. The quota is enforced twice: a cheap pre-check on the row
//! that was read, then the store's atomic increment-if-below-quota, which is
//! the only check that counts under concurrency. A redemption that is
//! declined after the increment gives the use back.

use super::{ArtifactError, CoreConfig, access, bounded};
use crate::{
    models::{Token, TokenConstraints, TokenGrant, TokenKind},
    object_store::{ObjectStore, PresignMethod, PresignedUrl},
    store::MetadataStore,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::Serialize;
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const TOKEN_BYTES: usize = 32;

/// Multiple of `store_timeout` the engine waits on a usage increment. The
/// store gives up on its own after one `store_timeout`.
const INCREMENT_GRACE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    /// Where the holder redeems the token.
    pub access_url: String,
    pub kind: TokenKind,
}

/// Outcome of a successful redemption.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub artifact_uuid: Uuid,
    pub filename: String,
    pub content_type: String,
    pub presigned: PresignedUrl,
}

#[derive(Clone)]
pub struct TokenEngine {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    config: CoreConfig,
}

impl TokenEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        config: CoreConfig,
    ) -> Self {
        Self {
            metadata,
            objects,
            config,
        }
    }

    /// Issue a token of `kind` for `artifact_uuid`.
    ///
    /// `base_url` is the externally visible origin (`scheme://host`) used to
    /// build the returned access URL.
    pub async fn issue(
        &self,
        artifact_uuid: Uuid,
        kind: TokenKind,
        constraints: TokenConstraints,
        base_url: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, ArtifactError> {
        validate_constraints(&constraints)?;

        let exists = bounded(
            self.config.store_timeout,
            "artifact_exists",
            self.metadata.artifact_exists(artifact_uuid),
        )
        .await?;
        if !exists {
            return Err(ArtifactError::NotFound(artifact_uuid));
        }

        let row = Token {
            token: generate_token(),
            artifact_uuid,
            kind,
            valid_from: constraints.valid_from,
            valid_to: constraints.valid_to,
            max_uses: constraints.max_uses,
            current_uses: 0,
            allowed_cidr: constraints
                .allowed_cidr
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            created_at: now,
        };
        bounded(
            self.config.store_timeout,
            "insert_token",
            self.metadata.insert_token(&row),
        )
        .await?;

        info!(artifact = %artifact_uuid, kind = kind.as_str(), "token issued");
        Ok(IssuedToken {
            access_url: format!(
                "{}{}",
                base_url.trim_end_matches('/'),
                kind.access_path(&row.token)
            ),
            token: row.token,
            kind,
        })
    }

    /// Validate `token` for a `kind` redemption from `client_ip` at `now`,
    /// consume one use and mint a presigned URL.
    ///
    /// Exactly one use is consumed on success and none on any failure.
    pub async fn redeem(
        &self,
        token: &str,
        kind: TokenKind,
        client_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<Redemption, ArtifactError> {
        let grant = bounded(
            self.config.store_timeout,
            "get_token_grant",
            self.metadata.get_token_grant(token),
        )
        .await?
        .filter(|g| g.token.kind == kind)
        .ok_or(ArtifactError::InvalidToken)?;

        check_grant(&grant, kind, client_ip, now)?;

        let consumed = self.consume_use(token).await?;
        if !consumed {
            debug!(artifact = %grant.token.artifact_uuid, "lost the race for the last use");
            return Err(ArtifactError::QuotaExceeded);
        }

        let method = match kind {
            TokenKind::Download => PresignMethod::Get,
            TokenKind::Upload => PresignMethod::Put,
        };
        let key = grant.token.artifact_uuid.to_string();
        let presigned = match bounded(
            self.config.store_timeout,
            "presign",
            self.objects.presign(&key, method, self.config.presign_expiry),
        )
        .await
        {
            Ok(presigned) => presigned,
            Err(err) => {
                self.refund(token).await;
                return Err(err);
            }
        };

        info!(
            artifact = %grant.token.artifact_uuid,
            kind = kind.as_str(),
            uses = grant.token.current_uses + 1,
            "token redeemed"
        );
        Ok(Redemption {
            artifact_uuid: grant.token.artifact_uuid,
            filename: grant.filename,
            content_type: grant.content_type,
            presigned,
        })
    }

    /// Add one use through the store's atomic increment.
    ///
    /// The increment is never cancelled half-way; the store bounds its own
    /// wait for locks and connections. Should it still overrun, the caller
    /// gets `StoreUnavailable` and a use that lands afterwards is refunded,
    /// so a declined redemption never keeps a use.
    async fn consume_use(&self, token: &str) -> Result<bool, ArtifactError> {
        let metadata = self.metadata.clone();
        let owned = token.to_string();
        let mut increment =
            tokio::spawn(async move { metadata.increment_usage_if_below_quota(&owned).await });

        let limit = self.config.store_timeout * INCREMENT_GRACE;
        match tokio::time::timeout(limit, &mut increment).await {
            Ok(Ok(consumed)) => consumed.map_err(Into::into),
            Ok(Err(join)) => Err(ArtifactError::InternalError(format!(
                "usage increment task failed: {join}"
            ))),
            Err(_) => {
                warn!(timeout = ?limit, "usage increment overran; a late use will be refunded");
                let engine = self.clone();
                let token = token.to_string();
                tokio::spawn(async move {
                    if let Ok(Ok(true)) = increment.await {
                        engine.refund(&token).await;
                    }
                });
                Err(ArtifactError::StoreUnavailable(format!(
                    "increment_usage timed out after {limit:?}"
                )))
            }
        }
    }

    async fn refund(&self, token: &str) {
        let refund = bounded(
            self.config.store_timeout,
            "refund_usage",
            self.metadata.refund_usage(token),
        )
        .await;
        if let Err(err) = refund {
            warn!(error = %err, "could not refund token use");
        }
    }
}

/// Constraint checks in reporting order: window, quota, origin, readiness.
fn check_grant(
    grant: &TokenGrant,
    kind: TokenKind,
    client_ip: IpAddr,
    now: DateTime<Utc>,
) -> Result<(), ArtifactError> {
    let token = &grant.token;
    access::check_window(token.valid_from, token.valid_to, now)?;
    access::check_quota(token.max_uses, token.current_uses)?;
    access::check_origin(token.allowed_cidr.as_deref(), client_ip)?;

    let required = kind.required_status();
    if grant.artifact_status != required {
        return Err(ArtifactError::ArtifactNotReady {
            status: grant.artifact_status.as_str(),
            required: required.as_str(),
        });
    }
    Ok(())
}

fn validate_constraints(constraints: &TokenConstraints) -> Result<(), ArtifactError> {
    if let (Some(from), Some(to)) = (constraints.valid_from, constraints.valid_to) {
        if from >= to {
            return Err(ArtifactError::InvalidRequest(
                "valid_from must be earlier than valid_to".into(),
            ));
        }
    }
    if constraints.max_uses.is_some_and(|max| max < 0) {
        return Err(ArtifactError::InvalidRequest(
            "usage limit must not be negative".into(),
        ));
    }
    if let Some(cidr) = constraints.allowed_cidr.as_deref() {
        if !cidr.trim().is_empty() {
            access::parse_cidr(cidr).map_err(ArtifactError::InvalidRequest)?;
        }
    }
    Ok(())
}

/// 256 bits from the OS CSPRNG, URL-safe base64 without padding.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_url_safe_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn rejects_inverted_window_and_bad_cidr() {
        let now = Utc::now();
        let inverted = TokenConstraints {
            valid_from: Some(now),
            valid_to: Some(now),
            ..Default::default()
        };
        assert!(matches!(
            validate_constraints(&inverted),
            Err(ArtifactError::InvalidRequest(_))
        ));

        let bad_cidr = TokenConstraints {
            allowed_cidr: Some("10.0.0.0/40".into()),
            ..Default::default()
        };
        assert!(matches!(
            validate_constraints(&bad_cidr),
            Err(ArtifactError::InvalidRequest(_))
        ));

        let negative = TokenConstraints {
            max_uses: Some(-1),
            ..Default::default()
        };
        assert!(validate_constraints(&negative).is_err());
        assert!(validate_constraints(&TokenConstraints::default()).is_ok());
    }
}
