//! Handles for process-wide singleton resources.
//!
//! A capability that wraps one shared database handle or one automation
//! context holds a [`SharedResource`] instead of global state. Individual
//! calls go through [`SharedResource::with`], which serializes access. The
//! orchestrator takes a [`ResourceLease`] for the whole of a session, so a
//! second session that needs the same resource is refused up front rather
//! than interleaving with the first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ResourceError;

struct ResourceInner<T> {
    value: Mutex<Option<T>>,
    leased: AtomicBool,
}

/// Shared handle with an explicit open/close lifecycle.
pub struct SharedResource<T> {
    name: String,
    inner: Arc<ResourceInner<T>>,
}

impl<T> Clone for SharedResource<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> SharedResource<T> {
    pub fn open(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(ResourceInner {
                value: Mutex::new(Some(value)),
                leased: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    pub fn is_leased(&self) -> bool {
        self.inner.leased.load(Ordering::Acquire)
    }

    /// Close the resource and hand back its value. Fails while leased.
    ///
    /// The lease flag is held for the duration of the close, so no session
    /// can lease the resource between the check and the take.
    pub fn close(&self) -> Result<T, ResourceError> {
        self.claim()?;
        let value = self.inner.value.lock().take();
        self.inner.leased.store(false, Ordering::Release);
        value.ok_or_else(|| self.closed())
    }

    /// Take the session-level lease.
    pub fn lease(&self) -> Result<ResourceLease<T>, ResourceError> {
        self.claim()?;
        let lease = ResourceLease {
            resource: self.clone(),
        };
        if !self.is_open() {
            return Err(self.closed());
        }
        Ok(lease)
    }

    fn claim(&self) -> Result<(), ResourceError> {
        self.inner
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| self.busy())
    }

    /// Run `f` with exclusive access to the value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, ResourceError> {
        let mut guard = self.inner.value.lock();
        let value = guard.as_mut().ok_or_else(|| self.closed())?;
        Ok(f(value))
    }

    fn busy(&self) -> ResourceError {
        ResourceError::Busy {
            name: self.name.clone(),
        }
    }

    fn closed(&self) -> ResourceError {
        ResourceError::Closed {
            name: self.name.clone(),
        }
    }
}

/// Exclusive session-level claim on a resource, released on drop.
pub struct ResourceLease<T> {
    resource: SharedResource<T>,
}

impl<T> ResourceLease<T> {
    pub fn name(&self) -> &str {
        self.resource.name()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, ResourceError> {
        self.resource.with(f)
    }
}

impl<T> Drop for ResourceLease<T> {
    fn drop(&mut self) {
        self.resource.inner.leased.store(false, Ordering::Release);
    }
}

/// A type-erased [`ResourceLease`], released on drop.
pub type HeldLease = Box<dyn Send + Sync>;

/// Type-erased view used by the pipeline to lease resources per session.
pub trait ExclusiveResource: Send + Sync {
    fn resource_name(&self) -> &str;
    fn acquire(&self) -> Result<HeldLease, ResourceError>;
}

impl<T: Send + 'static> ExclusiveResource for SharedResource<T> {
    fn resource_name(&self) -> &str {
        self.name()
    }

    fn acquire(&self) -> Result<HeldLease, ResourceError> {
        Ok(Box::new(self.lease()?))
    }
}
