//! Concurrency limits for batch commits.
//!
//! Every batch holds a [`DispatchPermit`] while it is being committed. Permits come either from
//! the adaptive [`RateController`] or, when throttling is disabled, from a static
//! [`ConcurrencyLimiter`] backed by a tokio semaphore. Dropping the permit returns it.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::WriterConfig;
use crate::throttle::{self, RateController, ThrottleState};

/// Limits concurrent commits to a fixed number.
#[derive(Clone, Debug)]
pub(crate) struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyLimiter {
    /// Creates a new limiter with the given maximum number of permits.
    pub(crate) fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Tries to acquire a permit without waiting.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn try_acquire(&self) -> Option<DispatchPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(DispatchPermit::fixed(permit))
    }

    /// Waits until a permit is available and takes it.
    pub(crate) async fn acquire(&self) -> DispatchPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("dispatch semaphore is never closed");
        DispatchPermit::fixed(permit)
    }

    /// Returns the number of permits currently held.
    pub(crate) fn used_permits(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }
}

/// RAII guard for the right to commit one batch.
///
/// Dropping this permit releases it back to the limiter it came from.
#[derive(Debug)]
pub struct DispatchPermit {
    source: PermitSource,
}

#[derive(Debug)]
enum PermitSource {
    Adaptive(Arc<throttle::Shared>),
    Fixed(#[allow(dead_code)] OwnedSemaphorePermit),
}

impl DispatchPermit {
    pub(crate) fn adaptive(shared: Arc<throttle::Shared>) -> Self {
        Self {
            source: PermitSource::Adaptive(shared),
        }
    }

    fn fixed(permit: OwnedSemaphorePermit) -> Self {
        Self {
            source: PermitSource::Fixed(permit),
        }
    }
}

impl Drop for DispatchPermit {
    fn drop(&mut self) {
        // Semaphore permits return themselves when dropped.
        if let PermitSource::Adaptive(shared) = &self.source {
            shared.release();
        }
    }
}

/// The limiter in use for a writer, depending on whether throttling is enabled.
#[derive(Clone, Debug)]
pub(crate) enum Limiter {
    Adaptive(RateController),
    Static(ConcurrencyLimiter),
}

impl Limiter {
    pub(crate) fn new(config: &WriterConfig) -> Self {
        if config.throttle.enabled {
            Self::Adaptive(RateController::new(config.throttle.clone()))
        } else {
            Self::Static(ConcurrencyLimiter::new(config.static_concurrency))
        }
    }

    pub(crate) async fn acquire(&self) -> DispatchPermit {
        match self {
            Self::Adaptive(controller) => controller.acquire().await,
            Self::Static(limiter) => limiter.acquire().await,
        }
    }

    pub(crate) fn on_success(&self) {
        if let Self::Adaptive(controller) = self {
            controller.on_success();
        }
    }

    pub(crate) fn on_congestion(&self) {
        if let Self::Adaptive(controller) = self {
            controller.on_congestion();
        }
    }

    pub(crate) fn throttle_state(&self) -> Option<ThrottleState> {
        match self {
            Self::Adaptive(controller) => Some(controller.state()),
            Self::Static(_) => None,
        }
    }

    /// Returns the number of batches currently holding a permit.
    pub(crate) fn in_use(&self) -> usize {
        match self {
            Self::Adaptive(controller) => controller.state().in_use,
            Self::Static(limiter) => limiter.used_permits(),
        }
    }
}
