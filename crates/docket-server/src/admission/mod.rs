//! Admission pipeline: Auth → RateLimit → VersionCheck.
//!
//! Runs exactly once per connection attempt, before the WebSocket upgrade.
//! Each stage is an [`AdmissionGate`] that either lets the attempt through
//! (possibly recording what it learned in the [`AdmissionContext`]) or
//! rejects it with a stage-scoped [`AdmissionError`], short-circuiting the
//! rest.
//!
//! The order is fixed by [`AdmissionChain::new`]. Identity must exist before
//! per-identity rate limiting, and the version check runs last so a client
//! with an incompatible version is told so rather than "too many requests".

pub mod auth;
pub mod errors;
pub mod rate_limit;
pub mod version;

use docket_core::{ConnectionId, SessionId};
use docket_settings::AdmissionSettings;
use metrics::counter;
use tracing::{debug, warn};

pub use auth::{AuthGate, AuthMethod, Identity, JwtVerifier, StaticTokens, TokenVerifier};
pub use errors::{AdmissionError, AuthError};
pub use rate_limit::{RateLimitGate, TokenBucket};
pub use version::VersionGate;

use crate::metrics::ADMISSION_REJECTIONS_TOTAL;
use crate::mode::StreamMode;

/// Everything a client presents when it opens a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionAttempt {
    /// Session to stream.
    pub session_id: SessionId,
    /// Bearer token, from the `Authorization` header or `token` query.
    pub credential: Option<String>,
    /// Declared protocol version, unparsed.
    pub protocol_version: Option<String>,
    /// Last sequence the client processed; absent for a fresh client.
    pub last_acked: Option<u64>,
    /// Previous connection to resume.
    pub resume: Option<ConnectionId>,
    /// Mode the client asks for; only honoured on a session's first resolution.
    pub requested_mode: Option<StreamMode>,
}

impl ConnectionAttempt {
    /// Minimal attempt for `session_id`.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            credential: None,
            protocol_version: None,
            last_acked: None,
            resume: None,
            requested_mode: None,
        }
    }
}

/// Mutable scratch state threaded through the gates.
#[derive(Debug)]
pub struct AdmissionContext<'a> {
    /// The attempt under evaluation.
    pub attempt: &'a ConnectionAttempt,
    /// Set by the auth stage.
    pub identity: Option<Identity>,
    /// Set by the version stage.
    pub protocol_version: Option<u32>,
}

/// One stage of the pipeline.
pub trait AdmissionGate: Send + Sync {
    /// Stage name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Pass (`Ok`) or reject the attempt.
    fn check(&self, ctx: &mut AdmissionContext<'_>) -> Result<(), AdmissionError>;
}

/// A successfully admitted attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admitted {
    /// Who connected.
    pub identity: Identity,
    /// Negotiated protocol version.
    pub protocol_version: u32,
}

/// The ordered pipeline.
pub struct AdmissionChain {
    auth: AuthGate,
    rate_limit: RateLimitGate,
    version: VersionGate,
}

impl AdmissionChain {
    /// Compose the three stages in their fixed order.
    pub fn new(auth: AuthGate, rate_limit: RateLimitGate, version: VersionGate) -> Self {
        Self {
            auth,
            rate_limit,
            version,
        }
    }

    fn gates(&self) -> [&dyn AdmissionGate; 3] {
        [&self.auth, &self.rate_limit, &self.version]
    }

    /// Build the chain from settings.
    pub fn from_settings(settings: &AdmissionSettings) -> Self {
        let mut verifiers: Vec<Box<dyn TokenVerifier>> = Vec::new();
        if !settings.tokens.is_empty() {
            verifiers.push(Box::new(StaticTokens::from_settings(&settings.tokens)));
        }
        if let Some(secret) = settings.jwt_secret.as_deref() {
            verifiers.push(Box::new(JwtVerifier::hs256(secret.as_bytes())));
        }
        if verifiers.is_empty() {
            warn!("no credentials configured, every connection attempt will be refused");
        }
        Self::new(
            AuthGate::new(verifiers),
            RateLimitGate::new(
                settings.rate_limit.capacity,
                settings.rate_limit.refill_per_sec,
            ),
            VersionGate::new(settings.supported_versions.clone()),
        )
    }

    /// Forget rate-limit state that a fresh bucket would reproduce.
    pub fn sweep_idle(&self) -> usize {
        self.rate_limit.sweep_idle(tokio::time::Instant::now())
    }

    /// Stage names in execution order.
    pub fn stages(&self) -> Vec<&'static str> {
        self.gates().iter().map(|g| g.name()).collect()
    }

    /// Run only the auth stage. Producer requests are authenticated but
    /// neither rate limited nor version checked.
    pub fn authenticate(&self, attempt: &ConnectionAttempt) -> Result<Identity, AdmissionError> {
        let mut ctx = AdmissionContext {
            attempt,
            identity: None,
            protocol_version: None,
        };
        self.auth.check(&mut ctx)?;
        ctx.identity
            .ok_or(AdmissionError::Auth(AuthError::MissingCredential))
    }

    /// Run every stage against `attempt`.
    pub fn admit(&self, attempt: &ConnectionAttempt) -> Result<Admitted, AdmissionError> {
        let mut ctx = AdmissionContext {
            attempt,
            identity: None,
            protocol_version: None,
        };
        for gate in self.gates() {
            if let Err(err) = gate.check(&mut ctx) {
                counter!(ADMISSION_REJECTIONS_TOTAL, "stage" => gate.name()).increment(1);
                warn!(
                    session_id = %attempt.session_id,
                    stage = gate.name(),
                    code = err.code(),
                    error = %err,
                    "connection attempt rejected"
                );
                return Err(err);
            }
        }

        let identity = ctx
            .identity
            .ok_or(AdmissionError::Auth(AuthError::MissingCredential))?;
        let protocol_version = ctx.protocol_version.ok_or(AdmissionError::VersionMismatch {
            requested: attempt.protocol_version.clone(),
            minimum: 1,
        })?;
        debug!(
            session_id = %attempt.session_id,
            subject = %identity.subject,
            protocol_version,
            "connection attempt admitted"
        );
        Ok(Admitted {
            identity,
            protocol_version,
        })
    }
}
