//! Vigil Proxy - Certificate authority and engine controller for the
//! Vigil filtering engine.
//!
//! This crate provides the transparent-TLS side of the engine: an
//! in-memory root certificate authority that mints per-host leaf
//! certificates, OS trust-store integration for the root, and the
//! [`Engine`] controller that ties the CA together with the rule engine
//! from `vigil-core` and exposes the surface an embedding application
//! drives.
//!
//! Socket handling, HTTP parsing, and traffic relay live in the external
//! pipeline; this crate answers its questions (certificate for this host,
//! verdict for this request, selectors for this page) and nothing more.

mod ca;
mod config;
mod engine;
mod error;
mod keys;
mod trust;

pub use ca::{CaIdentity, CertificateStore, HostCertificate};
pub use config::{
    BlockedElementsReporter, BlockedRequestReporter, ContentClassifier, EngineCallbacks,
    EngineConfig, FirewallCheck, MessageSink, DEFAULT_BLOCKED_PAGE,
};
pub use engine::{Engine, EngineState};
pub use error::{CryptoError, EngineError, Result, TrustStoreError};
pub use keys::KeyPairFactory;
pub use trust::{native_trust_store, NullTrustStore, TrustStore};

// The decision types flow through the engine's query surface; re-export
// them so embedders depend on one crate.
pub use vigil_core::{
    BlockReport, Category, CategoryId, ElementReport, EngineOption, LoadOutcome, RequestVerdict,
    ResourceKind, TriggerMatch, UNFILTERED_CATEGORY,
};
