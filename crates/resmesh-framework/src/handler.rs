//! Handler registration.
//!
//! A [`Handler`] is built fluently, one function per capability or sub-method,
//! and registered on a resource pattern with
//! [`ServiceBuilder::handle`](crate::ServiceBuilder::handle). Request
//! functions are plain async functions or closures taking the request view of
//! their kind and returning [`HandlerResult`].
//!
//! # Example
//!
//! ```rust,ignore
//! use resmesh_framework::{CallRequest, GetRequest, Handler, HandlerResult};
//!
//! async fn get_book(req: GetRequest) -> HandlerResult {
//!     req.model(&json!({"title": "Dune"})).await;
//!     Ok(())
//! }
//!
//! async fn set_book(req: CallRequest) -> HandlerResult {
//!     let params: SetParams = req.parse_params()?;
//!     req.change_event(params.into_changes()).await?;
//!     req.ok_empty().await;
//!     Ok(())
//! }
//!
//! let handler = Handler::new()
//!     .get_model(get_book)
//!     .call("set", set_book)
//!     .group("shelf.${shelf}");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::BitOr;
use std::pin::Pin;
use std::sync::Arc;

use resmesh_core::{GroupTemplate, RequestKind};
use serde_json::{Map, Value};

use crate::apply::{CachedValue, ValueCache};
use crate::error::{EventResult, RegistrationError};
use crate::request::{AccessRequest, AuthRequest, CallRequest, GetRequest};
use crate::resource::Resource;

/// A type alias for a boxed, pinned future that is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Return type of request handler functions.
///
/// Returning a [`ResError`](resmesh_core::ResError) sends it as the error
/// reply. Any other error, or a panic, becomes `system.internalError`.
pub type HandlerResult = anyhow::Result<()>;

/// Name of the reserved call method that creates a resource.
pub const NEW_METHOD: &str = "new";

// =============================================================================
// RequestHandler
// =============================================================================

/// A function handling one request kind.
///
/// Implemented for every `Fn(R) -> impl Future<Output = HandlerResult>`.
pub trait RequestHandler<R>: Send + Sync + 'static {
    /// Invokes the handler.
    fn call(&self, req: R) -> BoxFuture<'static, HandlerResult>;
}

impl<R, F, Fut> RequestHandler<R> for F
where
    R: Send + 'static,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, req: R) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(req))
    }
}

/// A shared, type-erased request handler.
pub type BoxedRequestHandler<R> = Arc<dyn RequestHandler<R>>;

// =============================================================================
// Apply function types
// =============================================================================

/// Applies a change to the cached model and returns the revert map.
pub type ApplyChangeFn =
    Arc<dyn Fn(&Resource, &Map<String, Value>) -> EventResult<Map<String, Value>> + Send + Sync>;
/// Inserts a value into the cached collection.
pub type ApplyAddFn = Arc<dyn Fn(&Resource, &Value, usize) -> EventResult<()> + Send + Sync>;
/// Removes a value from the cached collection and returns it.
pub type ApplyRemoveFn = Arc<dyn Fn(&Resource, usize) -> EventResult<Value> + Send + Sync>;
/// Creates the cached value.
pub type ApplyCreateFn = Arc<dyn Fn(&Resource, &Value) -> EventResult<()> + Send + Sync>;
/// Deletes the cached value and returns its data.
pub type ApplyDeleteFn = Arc<dyn Fn(&Resource) -> EventResult<Value> + Send + Sync>;
/// Applies a custom event.
pub type ApplyCustomFn = Arc<dyn Fn(&Resource, &str, &Value) -> EventResult<()> + Send + Sync>;

/// The apply functions of a handler, one optional function per event kind.
#[derive(Clone, Default)]
pub struct ApplyFns {
    pub(crate) change: Option<ApplyChangeFn>,
    pub(crate) add: Option<ApplyAddFn>,
    pub(crate) remove: Option<ApplyRemoveFn>,
    pub(crate) create: Option<ApplyCreateFn>,
    pub(crate) delete: Option<ApplyDeleteFn>,
    pub(crate) custom: Option<ApplyCustomFn>,
}

// =============================================================================
// Capabilities
// =============================================================================

/// The set of request kinds a handler answers.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No capability.
    pub const NONE: Self = Self(0);
    /// Answers access requests.
    pub const ACCESS: Self = Self(1);
    /// Answers get requests.
    pub const GET: Self = Self(1 << 1);
    /// Answers call requests.
    pub const CALL: Self = Self(1 << 2);
    /// Answers auth requests.
    pub const AUTH: Self = Self(1 << 3);

    /// The capability bit of a request kind.
    pub fn of(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Access => Self::ACCESS,
            RequestKind::Get => Self::GET,
            RequestKind::Call => Self::CALL,
            RequestKind::Auth => Self::AUTH,
        }
    }

    /// Returns `true` if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if requests of `kind` are answered.
    pub fn allows(self, kind: RequestKind) -> bool {
        self.contains(Self::of(kind))
    }

    /// Returns `true` if no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = RequestKind::ALL
            .iter()
            .filter(|kind| self.allows(**kind))
            .map(RequestKind::as_str)
            .collect();
        write!(f, "Capabilities({})", names.join("|"))
    }
}

/// The value shape of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResourceType {
    /// Not declared; any get reply and any event is accepted.
    #[default]
    Unknown,
    /// A keyed object.
    Model,
    /// An ordered sequence.
    Collection,
}

// =============================================================================
// Handler
// =============================================================================

/// Fluent builder for the functions serving one resource pattern.
#[derive(Clone, Default)]
pub struct Handler {
    resource_type: ResourceType,
    access: Option<BoxedRequestHandler<AccessRequest>>,
    get: Option<BoxedRequestHandler<GetRequest>>,
    call_methods: HashMap<String, BoxedRequestHandler<CallRequest>>,
    call_fallback: Option<BoxedRequestHandler<CallRequest>>,
    auth_methods: HashMap<String, BoxedRequestHandler<AuthRequest>>,
    auth_fallback: Option<BoxedRequestHandler<AuthRequest>>,
    apply: ApplyFns,
    group: Option<String>,
}

impl Handler {
    /// Creates a handler without any capability.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the access handler.
    pub fn access<F>(mut self, f: F) -> Self
    where
        F: RequestHandler<AccessRequest>,
    {
        self.access = Some(Arc::new(f));
        self
    }

    /// Sets the get handler of a model resource.
    pub fn get_model<F>(mut self, f: F) -> Self
    where
        F: RequestHandler<GetRequest>,
    {
        self.resource_type = ResourceType::Model;
        self.get = Some(Arc::new(f));
        self
    }

    /// Sets the get handler of a collection resource.
    pub fn get_collection<F>(mut self, f: F) -> Self
    where
        F: RequestHandler<GetRequest>,
    {
        self.resource_type = ResourceType::Collection;
        self.get = Some(Arc::new(f));
        self
    }

    /// Sets the get handler of a resource whose type is decided per request.
    pub fn get_resource<F>(mut self, f: F) -> Self
    where
        F: RequestHandler<GetRequest>,
    {
        self.resource_type = ResourceType::Unknown;
        self.get = Some(Arc::new(f));
        self
    }

    /// Registers a call method.
    pub fn call<F>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: RequestHandler<CallRequest>,
    {
        self.call_methods.insert(method.into(), Arc::new(f));
        self
    }

    /// Registers the handler for call methods without their own handler.
    pub fn call_fallback<F>(mut self, f: F) -> Self
    where
        F: RequestHandler<CallRequest>,
    {
        self.call_fallback = Some(Arc::new(f));
        self
    }

    /// Registers the reserved `new` call method.
    pub fn new_call<F>(self, f: F) -> Self
    where
        F: RequestHandler<CallRequest>,
    {
        self.call(NEW_METHOD, f)
    }

    /// Registers an auth method.
    pub fn auth<F>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: RequestHandler<AuthRequest>,
    {
        self.auth_methods.insert(method.into(), Arc::new(f));
        self
    }

    /// Registers the handler for auth methods without their own handler.
    pub fn auth_fallback<F>(mut self, f: F) -> Self
    where
        F: RequestHandler<AuthRequest>,
    {
        self.auth_fallback = Some(Arc::new(f));
        self
    }

    /// Sets the change apply function.
    pub fn apply_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &Map<String, Value>) -> EventResult<Map<String, Value>> + Send + Sync + 'static,
    {
        self.apply.change = Some(Arc::new(f));
        self
    }

    /// Sets the add apply function.
    pub fn apply_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &Value, usize) -> EventResult<()> + Send + Sync + 'static,
    {
        self.apply.add = Some(Arc::new(f));
        self
    }

    /// Sets the remove apply function.
    pub fn apply_remove<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, usize) -> EventResult<Value> + Send + Sync + 'static,
    {
        self.apply.remove = Some(Arc::new(f));
        self
    }

    /// Sets the create apply function.
    pub fn apply_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &Value) -> EventResult<()> + Send + Sync + 'static,
    {
        self.apply.create = Some(Arc::new(f));
        self
    }

    /// Sets the delete apply function.
    pub fn apply_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource) -> EventResult<Value> + Send + Sync + 'static,
    {
        self.apply.delete = Some(Arc::new(f));
        self
    }

    /// Sets the custom event apply function.
    pub fn apply_custom<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &str, &Value) -> EventResult<()> + Send + Sync + 'static,
    {
        self.apply.custom = Some(Arc::new(f));
        self
    }

    /// Serializes requests by a group key rendered from path parameters,
    /// e.g. `shelf.${shelf}`. Without a group, each resource has its own lane.
    pub fn group(mut self, template: impl Into<String>) -> Self {
        self.group = Some(template.into());
        self
    }

    /// Backs the apply functions with `cache`, keyed by resource name.
    ///
    /// Unless a get handler is set, get requests are answered from the cache
    /// and resources missing from it are not found.
    pub fn with_cache(mut self, cache: ValueCache) -> Self {
        let c = cache.clone();
        self.apply.change = Some(Arc::new(move |r: &Resource, changes: &Map<String, Value>| {
            c.apply_change(r.resource_name(), changes)
        }));
        let c = cache.clone();
        self.apply.add = Some(Arc::new(move |r: &Resource, value: &Value, idx: usize| {
            c.apply_add(r.resource_name(), value, idx)
        }));
        let c = cache.clone();
        self.apply.remove = Some(Arc::new(move |r: &Resource, idx: usize| {
            c.apply_remove(r.resource_name(), idx)
        }));
        let c = cache.clone();
        self.apply.create = Some(Arc::new(move |r: &Resource, data: &Value| {
            c.apply_create(r.resource_name(), data)
        }));
        let c = cache.clone();
        self.apply.delete = Some(Arc::new(move |r: &Resource| c.apply_delete(r.resource_name())));

        if self.get.is_none() {
            let get = move |req: GetRequest| {
                let cached = cache.get(req.resource_name());
                async move {
                    match cached {
                        Some(CachedValue::Model(model)) => req.model(&model).await,
                        Some(CachedValue::Collection(items)) => req.collection(&items).await,
                        None => req.not_found().await,
                    }
                    Ok(())
                }
            };
            self.get = Some(Arc::new(get));
        }
        self
    }

    /// Validates the handler and freezes it into a registry entry.
    pub fn build(self) -> Result<HandlerEntry, RegistrationError> {
        let group = self.group.as_deref().map(GroupTemplate::parse).transpose()?;

        let mut capabilities = Capabilities::NONE;
        if self.access.is_some() {
            capabilities = capabilities | Capabilities::ACCESS;
        }
        if self.get.is_some() {
            capabilities = capabilities | Capabilities::GET;
        }
        if !self.call_methods.is_empty() || self.call_fallback.is_some() {
            capabilities = capabilities | Capabilities::CALL;
        }
        if !self.auth_methods.is_empty() || self.auth_fallback.is_some() {
            capabilities = capabilities | Capabilities::AUTH;
        }

        Ok(HandlerEntry {
            resource_type: self.resource_type,
            capabilities,
            access: self.access,
            get: self.get,
            call_methods: self.call_methods,
            call_fallback: self.call_fallback,
            auth_methods: self.auth_methods,
            auth_fallback: self.auth_fallback,
            apply: self.apply,
            group,
        })
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("resource_type", &self.resource_type)
            .field("call_methods", &self.call_methods.keys().collect::<Vec<_>>())
            .field("auth_methods", &self.auth_methods.keys().collect::<Vec<_>>())
            .field("group", &self.group)
            .finish()
    }
}

// =============================================================================
// HandlerEntry
// =============================================================================

/// An immutable registry entry: the capability set and functions of one pattern.
pub struct HandlerEntry {
    pub(crate) resource_type: ResourceType,
    pub(crate) capabilities: Capabilities,
    pub(crate) access: Option<BoxedRequestHandler<AccessRequest>>,
    pub(crate) get: Option<BoxedRequestHandler<GetRequest>>,
    pub(crate) call_methods: HashMap<String, BoxedRequestHandler<CallRequest>>,
    pub(crate) call_fallback: Option<BoxedRequestHandler<CallRequest>>,
    pub(crate) auth_methods: HashMap<String, BoxedRequestHandler<AuthRequest>>,
    pub(crate) auth_fallback: Option<BoxedRequestHandler<AuthRequest>>,
    pub(crate) apply: ApplyFns,
    pub(crate) group: Option<GroupTemplate>,
}

impl HandlerEntry {
    /// The declared resource type.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// The request kinds this entry answers.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The group template, if any.
    pub fn group(&self) -> Option<&GroupTemplate> {
        self.group.as_ref()
    }

    /// Resolves a call method: the named handler first, then the fallback.
    pub(crate) fn call_method(&self, method: &str) -> Option<BoxedRequestHandler<CallRequest>> {
        self.call_methods
            .get(method)
            .or(self.call_fallback.as_ref())
            .cloned()
    }

    /// Resolves an auth method: the named handler first, then the fallback.
    pub(crate) fn auth_method(&self, method: &str) -> Option<BoxedRequestHandler<AuthRequest>> {
        self.auth_methods
            .get(method)
            .or(self.auth_fallback.as_ref())
            .cloned()
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("resource_type", &self.resource_type)
            .field("capabilities", &self.capabilities)
            .field("group", &self.group.as_ref().map(GroupTemplate::as_str))
            .finish()
    }
}
