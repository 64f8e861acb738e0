//! The three independent change producers: push-based filesystem watcher,
//! periodic full-tree scanner, and remote change-feed poller.
//!
//! Each source runs its own loop under a `CancellationToken`, converts
//! everything it sees into
//! [`Reconciler`](crate::reconcile::Reconciler) calls, and treats its own
//! failures as log-and-retry: a transient error sleeps the source for a
//! capped interval, it never takes the process down.

use std::time::Duration;

pub mod remote;
pub mod scan;
pub mod watch;

pub use remote::{HttpChangeFeed, RemoteChangeFeed, RemoteItem, RemoteSource};
pub use scan::{ScanSource, ScanStats};
pub use watch::WatchSource;

/// Wait applied after a failed source iteration before retrying, capped so a
/// long polling interval does not delay recovery.
pub(crate) fn failure_backoff(interval: Duration) -> Duration {
    interval.min(Duration::from_secs(60))
}
