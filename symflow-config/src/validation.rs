use thiserror::Error;

use crate::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("paths.{field} is required and must not be empty")]
    MissingPath { field: &'static str },
    #[error("paths.monitored_root and paths.link_base must differ")]
    OverlappingRoots,
    #[error("scan.cache_max_age_secs ({cache}) must be below index.gc_max_age_secs ({gc})")]
    CacheOutlivesGc { cache: u64, gc: u64 },
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[error("remote.{field} is required when remote.enabled is true")]
    MissingRemoteField { field: &'static str },
    #[error("notifier.api_token is required when notifier.base_url is set")]
    MissingApiToken,
    #[error("materialize.media_extensions must not be empty")]
    EmptyExtensionList,
}

/// Reject configurations the daemon cannot run correctly with.
///
/// The cache/GC ordering matters most: if the scanner's hot cache outlives
/// the index garbage collector, records for perfectly healthy files stop
/// having their `last_seen` refreshed and get collected.
pub fn apply_guard_rails(config: &Config) -> Result<(), ConfigGuardRailError> {
    if config.paths.monitored_root.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::MissingPath {
            field: "monitored_root",
        });
    }
    if config.paths.link_base.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::MissingPath { field: "link_base" });
    }
    if config.paths.link_base.starts_with(&config.paths.monitored_root)
        || config.paths.monitored_root.starts_with(&config.paths.link_base)
    {
        return Err(ConfigGuardRailError::OverlappingRoots);
    }

    if config.scan.cache_max_age_secs >= config.index.gc_max_age_secs {
        return Err(ConfigGuardRailError::CacheOutlivesGc {
            cache: config.scan.cache_max_age_secs,
            gc: config.index.gc_max_age_secs,
        });
    }

    for (field, value) in [
        ("scan.interval_secs", config.scan.interval_secs),
        ("index.gc_interval_secs", config.index.gc_interval_secs),
        (
            "notifier.flush_interval_secs",
            config.notifier.flush_interval_secs,
        ),
    ] {
        if value == 0 {
            return Err(ConfigGuardRailError::ZeroInterval { field });
        }
    }
    if config.remote.enabled && config.remote.interval_secs == 0 {
        return Err(ConfigGuardRailError::ZeroInterval {
            field: "remote.interval_secs",
        });
    }

    if config.remote.enabled {
        if config.remote.base_url.trim().is_empty() {
            return Err(ConfigGuardRailError::MissingRemoteField { field: "base_url" });
        }
        if config.remote.root_item_id.trim().is_empty() {
            return Err(ConfigGuardRailError::MissingRemoteField {
                field: "root_item_id",
            });
        }
    }

    if !config.notifier.base_url.trim().is_empty() && config.notifier.api_token.trim().is_empty() {
        return Err(ConfigGuardRailError::MissingApiToken);
    }

    if config.materialize.media_extensions.is_empty() {
        return Err(ConfigGuardRailError::EmptyExtensionList);
    }

    Ok(())
}
