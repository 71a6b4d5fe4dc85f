//! Method routing for inbound requests and notifications.
//!
//! A [`Router`] holds two independent tables: call-style methods, which
//! return a value or fail, and notify-style methods, which return nothing to
//! the peer. The router is built by the application and handed to the
//! endpoint as a shared, read-only `Arc<Router>`.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use rmpv::Value;

/// Handler for a call-style method. The error value becomes the response's
/// error payload on the wire.
///
/// Use the `#[async_trait]` attribute from the `async_trait` crate when
/// implementing this trait.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(&self, params: Vec<Value>) -> std::result::Result<Value, Value>;
}

/// Handler for a notify-style method. There is no reply channel; a returned
/// error is logged by the endpoint and discarded.
#[async_trait]
pub trait NotifyHandler: Send + Sync + 'static {
    async fn handle(&self, params: Vec<Value>) -> std::result::Result<(), Value>;
}

struct CallFn<F>(F);

#[async_trait]
impl<F> CallHandler for CallFn<F>
where
    F: Fn(Vec<Value>) -> std::result::Result<Value, Value> + Send + Sync + 'static,
{
    async fn handle(&self, params: Vec<Value>) -> std::result::Result<Value, Value> {
        (self.0)(params)
    }
}

struct NotifyFn<F>(F);

#[async_trait]
impl<F> NotifyHandler for NotifyFn<F>
where
    F: Fn(Vec<Value>) -> std::result::Result<(), Value> + Send + Sync + 'static,
{
    async fn handle(&self, params: Vec<Value>) -> std::result::Result<(), Value> {
        (self.0)(params)
    }
}

/// Maps method names to handlers, separately for calls and notifications.
///
/// Registration is additive; re-registering a name overwrites the prior
/// handler.
#[derive(Default)]
pub struct Router {
    calls: HashMap<String, Arc<dyn CallHandler>>,
    notifies: HashMap<String, Arc<dyn NotifyHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call-style handler.
    pub fn register_call(&mut self, name: impl Into<String>, handler: impl CallHandler) {
        self.calls.insert(name.into(), Arc::new(handler));
    }

    /// Registers a notify-style handler.
    pub fn register_notify(&mut self, name: impl Into<String>, handler: impl NotifyHandler) {
        self.notifies.insert(name.into(), Arc::new(handler));
    }

    /// Registers a plain function as a call-style handler.
    pub fn register_call_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, Value> + Send + Sync + 'static,
    {
        self.register_call(name, CallFn(f));
    }

    /// Registers a plain function as a notify-style handler.
    pub fn register_notify_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> std::result::Result<(), Value> + Send + Sync + 'static,
    {
        self.register_notify(name, NotifyFn(f));
    }

    pub(crate) fn call_handler(&self, name: &str) -> Option<Arc<dyn CallHandler>> {
        self.calls.get(name).cloned()
    }

    pub(crate) fn notify_handler(&self, name: &str) -> Option<Arc<dyn NotifyHandler>> {
        self.notifies.get(name).cloned()
    }

    /// Names of all registered call-style methods.
    pub fn call_methods(&self) -> impl Iterator<Item = &str> {
        self.calls.keys().map(String::as_str)
    }

    /// Names of all registered notify-style methods.
    pub fn notify_methods(&self) -> impl Iterator<Item = &str> {
        self.notifies.keys().map(String::as_str)
    }
}
