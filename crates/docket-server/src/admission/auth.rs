//! Authentication stage.
//!
//! Credentials are bearer tokens checked against a list of
//! [`TokenVerifier`]s in order: configured static tokens first, then HS256
//! signed tokens. A signed token may carry a `sid` claim restricting it to
//! one session.

use std::collections::HashMap;

use docket_core::SessionId;
use docket_settings::StaticToken;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::errors::{AdmissionError, AuthError};
use super::{AdmissionContext, AdmissionGate};

/// How an identity was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// A configured static token.
    StaticToken,
    /// A signed session token.
    Jwt,
}

/// An authenticated principal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Stable subject; rate limits and connection resumption key on it.
    pub subject: String,
    /// How it was verified.
    pub method: AuthMethod,
}

/// Checks one kind of credential.
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` for a connection to `session_id`.
    ///
    /// [`AuthError::InvalidCredential`] means "not mine", letting the next
    /// verifier try. Any other error is final.
    fn verify(&self, token: &str, session_id: &SessionId) -> Result<Identity, AuthError>;
}

/// Fixed token → subject table.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    /// Table from settings entries.
    pub fn from_settings(entries: &[StaticToken]) -> Self {
        Self {
            tokens: entries
                .iter()
                .map(|e| (e.token.clone(), e.subject.clone()))
                .collect(),
        }
    }
}

impl TokenVerifier for StaticTokens {
    fn verify(&self, token: &str, _session_id: &SessionId) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .map(|subject| Identity {
                subject: subject.clone(),
                method: AuthMethod::StaticToken,
            })
            .ok_or(AuthError::InvalidCredential)
    }
}

/// Claims carried by a signed session token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject.
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    /// Optional session restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// HS256 signed-token verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Verifier for tokens signed with `secret`.
    pub fn hs256(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str, session_id: &SessionId) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidCredential,
            })?;
        if let Some(sid) = data.claims.sid.as_deref() {
            if sid != session_id.as_str() {
                return Err(AuthError::WrongSession(session_id.to_string()));
            }
        }
        Ok(Identity {
            subject: data.claims.sub,
            method: AuthMethod::Jwt,
        })
    }
}

/// First pipeline stage: establishes [`Identity`].
pub struct AuthGate {
    verifiers: Vec<Box<dyn TokenVerifier>>,
}

impl AuthGate {
    /// Gate trying `verifiers` in order.
    pub fn new(verifiers: Vec<Box<dyn TokenVerifier>>) -> Self {
        Self { verifiers }
    }

    fn authenticate(&self, token: &str, session_id: &SessionId) -> Result<Identity, AuthError> {
        for verifier in &self.verifiers {
            match verifier.verify(token, session_id) {
                Err(AuthError::InvalidCredential) => {}
                other => return other,
            }
        }
        Err(AuthError::InvalidCredential)
    }
}

impl AdmissionGate for AuthGate {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn check(&self, ctx: &mut AdmissionContext<'_>) -> Result<(), AdmissionError> {
        let token = ctx
            .attempt
            .credential
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        ctx.identity = Some(self.authenticate(token, &ctx.attempt.session_id)?);
        Ok(())
    }
}
