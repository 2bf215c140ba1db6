//! Protocol version negotiation.

use super::errors::AdmissionError;
use super::{AdmissionContext, AdmissionGate};

/// Final pipeline stage: the declared version must be one we serve.
#[derive(Clone, Debug)]
pub struct VersionGate {
    supported: Vec<u32>,
}

impl VersionGate {
    /// Gate accepting exactly `supported`.
    pub fn new(mut supported: Vec<u32>) -> Self {
        supported.sort_unstable();
        supported.dedup();
        Self { supported }
    }

    /// Lowest supported version, or 1 when none are configured.
    pub fn minimum(&self) -> u32 {
        self.supported.first().copied().unwrap_or(1)
    }

    /// Whether `version` is served.
    pub fn supports(&self, version: u32) -> bool {
        self.supported.binary_search(&version).is_ok()
    }
}

impl AdmissionGate for VersionGate {
    fn name(&self) -> &'static str {
        "version_check"
    }

    fn check(&self, ctx: &mut AdmissionContext<'_>) -> Result<(), AdmissionError> {
        let declared = ctx.attempt.protocol_version.as_deref();
        match declared.and_then(|v| v.trim().parse::<u32>().ok()) {
            Some(version) if self.supports(version) => {
                ctx.protocol_version = Some(version);
                Ok(())
            }
            _ => Err(AdmissionError::VersionMismatch {
                requested: declared.map(str::to_owned),
                minimum: self.minimum(),
            }),
        }
    }
}
