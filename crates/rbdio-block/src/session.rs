//! Pool session
//!
//! The metadata and data handles used by one top-level operation. Both
//! handles close themselves when the session is dropped, so every exit path
//! releases them.

use crate::error::BlockResult;
use rbdio_client::{ObjectStore, Pool};
use rbdio_common::Version;
use std::sync::Arc;
use tracing::{debug, warn};

/// Metadata and data handles on one pool
#[derive(Debug)]
pub struct PoolSession {
    md: Pool,
    data: Pool,
}

impl PoolSession {
    /// Open both handles on `pool`
    pub async fn open(store: Arc<dyn ObjectStore>, pool: &str) -> BlockResult<Self> {
        let md = Pool::open(store.clone(), pool).await?;
        // `md` is dropped, and closed, if the second open fails.
        let data = Pool::open(store, pool).await?;
        Ok(Self { md, data })
    }

    /// Handle for headers, the directory and the info object
    #[must_use]
    pub const fn md(&self) -> &Pool {
        &self.md
    }

    /// Handle for block objects
    #[must_use]
    pub const fn data(&self) -> &Pool {
        &self.data
    }

    #[must_use]
    pub fn pool_name(&self) -> &str {
        self.md.name()
    }

    /// Tell watchers of a header object that it changed
    ///
    /// Without an explicit version the handle's last observed version is
    /// used. Failures are logged and swallowed.
    pub async fn notify_header_change(&self, oid: &str, version: Option<Version>) {
        let version = match version {
            Some(v) => v,
            None => match self.md.last_version() {
                Ok(v) => v,
                Err(e) => {
                    warn!(oid, error = %e, "no version to notify with");
                    return;
                }
            },
        };
        match self.md.notify(oid, version).await {
            Ok(()) => debug!(oid, version, "notified header change"),
            Err(e) => warn!(oid, version, error = %e, "header change notification failed"),
        }
    }
}
