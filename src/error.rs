//! Error kinds surfaced by the synthesis core
//!
//! Invariant violations are programming bugs and panic at the point of
//! detection; everything a caller can provoke or observe flows through
//! [`SynthesisError`].

use thiserror::Error;

/// Errors produced by the synthesis core
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The sketch, specification or quotient handed to the core is malformed:
    /// empty hole catalogs, labelings referencing unknown holes or options,
    /// constraint groups referencing unknown constraint indices, and similar.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The external model checker failed or returned an unusable result
    /// (no scheduler for a nondeterministic model, non-finite value with no
    /// defined fallback). The offending family and property are identified.
    #[error("verifier failure on family `{family}`, property `{property}`: {source}")]
    Verifier {
        /// Rendering of the family under verification
        family: String,

        /// Rendering of the property being checked
        property: String,

        /// Underlying checker error
        #[source]
        source: anyhow::Error,
    },

    /// A declared but unimplemented capability was exercised.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, SynthesisError>;
