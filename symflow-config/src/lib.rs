//! Configuration for the symflow daemon.
//!
//! One [`Config`] document covers every subsystem: monitored paths, the link
//! materializer, the three change sources, the task pipeline, the index store,
//! and the media server notifier. Loading follows environment overrides first,
//! then well-known files, then defaults; validation rejects documents that
//! would make the daemon misbehave rather than letting it limp along.

pub mod models;
pub mod validation;

pub use models::{
    Config, ConfigSource, IndexConfig, MaterializeConfig, NotifierSettings, PathsConfig,
    PipelineSettings, RemoteConfig, ScanConfig,
};
pub use validation::{ConfigGuardRailError, apply_guard_rails};
