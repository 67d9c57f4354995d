//! Resources whose lifetime is tied to a [`crate::telemetry_scope::TelemetryScope`].

use std::error::Error;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;

use tracing::warn;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Something a scope releases when the unit of work ends.
pub trait ScopedResource: Send {
    fn release(&mut self) -> Result<(), BoxError>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Runs a closure once, on release.
pub struct OnRelease<F> {
    name: &'static str,
    callback: Option<F>,
}

pub fn on_release<F>(name: &'static str, callback: F) -> OnRelease<F>
where
    F: FnOnce() -> Result<(), BoxError> + Send,
{
    OnRelease {
        name,
        callback: Some(callback),
    }
}

impl<F> ScopedResource for OnRelease<F>
where
    F: FnOnce() -> Result<(), BoxError> + Send,
{
    fn release(&mut self) -> Result<(), BoxError> {
        match self.callback.take() {
            Some(callback) => callback(),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Ordered set of resources released together, first added first released.
///
/// Release is best effort: a resource that errors or panics is logged and the
/// remaining resources are still released.
#[derive(Default)]
pub struct ResourceCollection {
    resources: Vec<Box<dyn ScopedResource>>,
}

impl ResourceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resource: impl ScopedResource + 'static) -> Self {
        self.push(resource);
        self
    }

    pub fn push(&mut self, resource: impl ScopedResource + 'static) {
        self.resources.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Releases every resource in insertion order and returns how many failed.
    pub fn release_all(&mut self) -> usize {
        let mut failures = 0;
        for mut resource in self.resources.drain(..) {
            match catch_unwind(AssertUnwindSafe(|| resource.release())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    warn!("failed to release {}: {err}", resource.name());
                }
                Err(_) => {
                    failures += 1;
                    warn!("releasing {} panicked", resource.name());
                }
            }
        }
        failures
    }
}

impl fmt::Debug for ResourceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.resources.iter().map(|resource| resource.name()))
            .finish()
    }
}

impl Drop for ResourceCollection {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Runs `f`, logging instead of propagating a panic.
pub(crate) fn contained(action: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("{action} panicked");
    }
}
