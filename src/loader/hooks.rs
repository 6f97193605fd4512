//! Lifecycle callbacks fired by [`HttpLoader`](super::HttpLoader).

use std::fmt;

use tracing::error;

use crate::aggregate::RespondedRequest;
use crate::error::LoadError;
use crate::http::Request;

type RequestHook = Box<dyn Fn(&Request) + Send + Sync>;
type RespondedHook = Box<dyn Fn(&RespondedRequest) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&Request, &LoadError) + Send + Sync>;

/// Callbacks run around every load, each kind in registration order.
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use crawler_core::loader::LoaderHooks;
///
/// let loads = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&loads);
/// let mut hooks = LoaderHooks::default();
/// hooks.before_load(move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
/// assert_eq!(hooks.len(), 1);
/// ```
#[derive(Default)]
pub struct LoaderHooks {
    before_load: Vec<RequestHook>,
    on_cache_hit: Vec<RespondedHook>,
    on_success: Vec<RespondedHook>,
    on_error: Vec<ErrorHook>,
    after_load: Vec<RequestHook>,
}

impl fmt::Debug for LoaderHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderHooks")
            .field("before_load", &self.before_load.len())
            .field("on_cache_hit", &self.on_cache_hit.len())
            .field("on_success", &self.on_success.len())
            .field("on_error", &self.on_error.len())
            .field("after_load", &self.after_load.len())
            .finish()
    }
}

impl LoaderHooks {
    /// Runs before anything else happens for a request.
    pub fn before_load(&mut self, hook: impl Fn(&Request) + Send + Sync + 'static) -> &mut Self {
        self.before_load.push(Box::new(hook));
        self
    }

    /// Runs when a response comes from the cache instead of the network.
    pub fn on_cache_hit(
        &mut self,
        hook: impl Fn(&RespondedRequest) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_cache_hit.push(Box::new(hook));
        self
    }

    /// Runs after a successful network load.
    pub fn on_success(
        &mut self,
        hook: impl Fn(&RespondedRequest) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_success.push(Box::new(hook));
        self
    }

    /// Runs when a load fails.
    pub fn on_error(
        &mut self,
        hook: impl Fn(&Request, &LoadError) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_error.push(Box::new(hook));
        self
    }

    /// Runs last, whatever the outcome.
    pub fn after_load(&mut self, hook: impl Fn(&Request) + Send + Sync + 'static) -> &mut Self {
        self.after_load.push(Box::new(hook));
        self
    }

    /// Total number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.before_load.len()
            + self.on_cache_hit.len()
            + self.on_success.len()
            + self.on_error.len()
            + self.after_load.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn emit_before_load(&self, request: &Request, lifecycle: &mut Lifecycle) {
        lifecycle.before_load_fired = true;
        for hook in &self.before_load {
            hook(request);
        }
    }

    pub(crate) fn emit_cache_hit(&self, responded: &RespondedRequest) {
        for hook in &self.on_cache_hit {
            hook(responded);
        }
    }

    pub(crate) fn emit_success(&self, responded: &RespondedRequest) {
        for hook in &self.on_success {
            hook(responded);
        }
    }

    pub(crate) fn emit_error(&self, request: &Request, error: &LoadError) {
        for hook in &self.on_error {
            hook(request, error);
        }
    }

    pub(crate) fn emit_after_load(&self, request: &Request, lifecycle: &Lifecycle) {
        if !lifecycle.before_load_fired {
            error!(url = %request.url, "after_load fired without before_load");
        }
        for hook in &self.after_load {
            hook(request);
        }
    }
}

/// Per-load record of which hooks already ran.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    before_load_fired: bool,
}
