//! Scoped ownership of externally acquired resources
//!
//! A [`Resource`] knows how to open and close one kind of handle (a browser
//! page, a server process, an authenticated client). A [`ResourceLease`]
//! owns at most one handle of that resource and guarantees it is closed
//! exactly once: explicitly through [`ResourceLease::release`], or from
//! `Drop` when the owning future is abandoned mid-attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AcquisitionError, ReleaseError};

/// Something a test attempt needs exclusive use of
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Name used in logs and error messages
    fn name(&self) -> String;

    async fn open(&self) -> Result<Self::Handle, AcquisitionError>;

    async fn close(&self, handle: Self::Handle) -> Result<(), ReleaseError>;
}

/// No resources at all
#[async_trait]
impl Resource for () {
    type Handle = ();

    fn name(&self) -> String {
        "none".to_string()
    }

    async fn open(&self) -> Result<(), AcquisitionError> {
        Ok(())
    }

    async fn close(&self, _handle: ()) -> Result<(), ReleaseError> {
        Ok(())
    }
}

/// Two resources opened in declared order and closed in reverse.
///
/// If the second one cannot be opened the first is closed again before the
/// error is returned, so a failed open never leaves anything behind. The
/// first handle is held by its own [`ResourceLease`] until the pair is
/// complete, so an open abandoned halfway (timeout, cancellation) still
/// closes it from `Drop`.
#[async_trait]
impl<A: Resource, B: Resource> Resource for (Arc<A>, Arc<B>) {
    type Handle = (A::Handle, B::Handle);

    fn name(&self) -> String {
        format!("{}+{}", self.0.name(), self.1.name())
    }

    async fn open(&self) -> Result<Self::Handle, AcquisitionError> {
        let mut first = ResourceLease::new(Arc::clone(&self.0));
        first.acquire().await?;
        match self.1.open().await {
            Ok(second) => match first.into_handle() {
                Some(first) => Ok((first, second)),
                None => Err(AcquisitionError::new(self.0.name(), "handle lost during open")),
            },
            Err(e) => {
                if let Err(rollback) = first.release().await {
                    warn!("Rollback after failed acquisition: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn close(&self, handle: Self::Handle) -> Result<(), ReleaseError> {
        let (first, second) = handle;
        let second_result = self.1.close(second).await;
        let first_result = self.0.close(first).await;

        match (second_result, first_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(second_err), Err(first_err)) => Err(ReleaseError::new(
                self.name(),
                format!("{}; {}", second_err, first_err),
            )),
        }
    }
}

/// Lease lifecycle; strictly linear, `Released` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Unacquired,
    Acquired,
    Released,
}

pub struct ResourceLease<R: Resource> {
    resource: Arc<R>,
    state: LeaseState,
    handle: Option<R::Handle>,
}

impl<R: Resource> ResourceLease<R> {
    pub fn new(resource: Arc<R>) -> Self {
        Self {
            resource,
            state: LeaseState::Unacquired,
            handle: None,
        }
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// The acquired handle, if the lease currently holds one
    pub fn handle(&self) -> Option<&R::Handle> {
        self.handle.as_ref()
    }

    /// Open the underlying resource.
    ///
    /// On failure the lease stays `Unacquired`. A lease is single-use: a
    /// second acquire, or an acquire after release, is rejected.
    pub async fn acquire(&mut self) -> Result<&R::Handle, AcquisitionError> {
        if self.state != LeaseState::Unacquired {
            return Err(AcquisitionError::new(
                self.resource.name(),
                format!("lease is already {:?}", self.state),
            ));
        }

        let handle = self.resource.open().await?;
        debug!("Acquired {}", self.resource.name());
        self.state = LeaseState::Acquired;
        let handle: &R::Handle = self.handle.insert(handle);
        Ok(handle)
    }

    /// Hand the held handle to the caller, who now owns closing it
    fn into_handle(mut self) -> Option<R::Handle> {
        self.state = LeaseState::Released;
        self.handle.take()
    }

    /// Close the handle if one is held. Idempotent.
    ///
    /// A teardown failure is logged and returned so the caller can attach
    /// it to the attempt; the lease is `Released` either way.
    pub async fn release(&mut self) -> Result<(), ReleaseError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.state = LeaseState::Released;

        match self.resource.close(handle).await {
            Ok(()) => {
                debug!("Released {}", self.resource.name());
                Ok(())
            }
            Err(e) => {
                warn!("Teardown failed: {}", e);
                Err(e)
            }
        }
    }
}

impl<R: Resource> Drop for ResourceLease<R> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.state = LeaseState::Released;

        let resource = Arc::clone(&self.resource);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    "Lease on {} dropped while held; releasing in background",
                    resource.name()
                );
                runtime.spawn(async move {
                    if let Err(e) = resource.close(handle).await {
                        warn!("Background teardown failed: {}", e);
                    }
                });
            }
            Err(_) => {
                // Without a runtime the handle's own Drop is the last resort.
                warn!(
                    "Lease on {} dropped outside a runtime; handle dropped without close",
                    resource.name()
                );
            }
        }
    }
}
