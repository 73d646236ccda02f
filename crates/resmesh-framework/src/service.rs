//! The resource service.
//!
//! A [`Service`] owns the handler registry, the group scheduler and the bus
//! connection. It subscribes to the request subjects of its name, dispatches
//! each inbound request onto the group lane of the target resource, and
//! publishes replies and events.
//!
//! # Example
//!
//! ```rust,ignore
//! use resmesh_framework::{Handler, Service};
//!
//! let service = Service::builder("library")
//!     .handle("book.$id", Handler::new().get_model(get_book).call("set", set_book))?
//!     .handle("books", Handler::new().get_collection(get_books))?
//!     .build()?;
//!
//! service.serve(conn).await?;
//! // ...
//! service.shutdown().await;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use parking_lot::{Mutex, RwLock};
use resmesh_core::{
    BoxedConnection, InboundMessage, RequestEnvelope, RequestKind, RequestSubject, ResError,
    ResetEvent, SYSTEM_RESET_SUBJECT, Subscription, TokenEvent, TransportError, TransportResult,
    frame, request_subscriptions, token_subject, validate_resource_name,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, Span, debug, field, info, span, trace, warn};

use crate::error::{EventError, EventResult, RegistrationError, ServiceError, ServiceResult};
use crate::handler::{BoxFuture, Handler};
use crate::options::{AccessFallback, ServiceOptions};
use crate::request::{
    AccessRequest, AuthRequest, CallRequest, GetRequest, Outcome, RequestCore, RequestState,
    run_handler,
};
use crate::resource::Resource;
use crate::router::Router;
use crate::scheduler::{GroupScheduler, Task};

/// A lifecycle callback.
pub type ServiceHook = Arc<dyn Fn(&Service) + Send + Sync>;

// =============================================================================
// ServiceBuilder
// =============================================================================

/// Builder for a [`Service`].
pub struct ServiceBuilder {
    name: String,
    router: Router,
    options: ServiceOptions,
    on_serve: Vec<ServiceHook>,
    on_shutdown: Vec<ServiceHook>,
}

impl ServiceBuilder {
    /// Registers `handler` for `pattern`, relative to the service name.
    ///
    /// With service name `library`, the pattern `book.$id` matches
    /// `library.book.42`.
    pub fn handle(mut self, pattern: &str, handler: Handler) -> Result<Self, RegistrationError> {
        check_service_name(&self.name)?;
        let entry = handler.build()?;
        let full = if self.name.is_empty() {
            pattern.to_string()
        } else {
            format!("{}.{pattern}", self.name)
        };
        self.router.add(&full, entry)?;
        Ok(self)
    }

    /// Sets the service options.
    pub fn options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a callback run once the service is serving.
    pub fn on_serve<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service) + Send + Sync + 'static,
    {
        self.on_serve.push(Arc::new(f));
        self
    }

    /// Adds a callback run after shutdown drained all lanes.
    pub fn on_shutdown<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service) + Send + Sync + 'static,
    {
        self.on_shutdown.push(Arc::new(f));
        self
    }

    /// Builds the service.
    pub fn build(self) -> Result<Service, RegistrationError> {
        check_service_name(&self.name)?;
        let scheduler = GroupScheduler::new(self.options.scheduler.clone());
        debug!(service = %self.name, patterns = self.router.len(), "Service built");

        Ok(Service {
            shared: Arc::new(ServiceShared {
                name: self.name,
                router: self.router,
                options: self.options,
                scheduler,
                conn: RwLock::new(None),
                serving: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                loops: Mutex::new(Vec::new()),
                on_serve: self.on_serve,
                on_shutdown: self.on_shutdown,
            }),
        })
    }
}

fn check_service_name(name: &str) -> Result<(), RegistrationError> {
    if name.is_empty() || validate_resource_name(name).is_ok() {
        Ok(())
    } else {
        Err(RegistrationError::InvalidServiceName(name.to_string()))
    }
}

// =============================================================================
// Service
// =============================================================================

struct ServiceShared {
    name: String,
    router: Router,
    options: ServiceOptions,
    scheduler: GroupScheduler,
    conn: RwLock<Option<BoxedConnection>>,
    serving: AtomicBool,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    on_serve: Vec<ServiceHook>,
    on_shutdown: Vec<ServiceHook>,
}

/// A resource service. Cheap to clone.
#[derive(Clone)]
pub struct Service {
    shared: Arc<ServiceShared>,
}

impl Service {
    /// Starts building a service named `name`.
    ///
    /// The name prefixes every registered pattern. An empty name registers
    /// patterns as absolute resource names.
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            router: Router::new(),
            options: ServiceOptions::default(),
            on_serve: Vec::new(),
            on_shutdown: Vec::new(),
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The service options.
    pub fn options(&self) -> &ServiceOptions {
        &self.shared.options
    }

    /// The registered patterns, including the service name prefix.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.shared.router.patterns()
    }

    /// Returns `true` between [`serve`](Self::serve) and [`shutdown`](Self::shutdown).
    pub fn is_serving(&self) -> bool {
        self.shared.serving.load(Ordering::SeqCst) && !self.shared.shutdown.is_cancelled()
    }

    /// Uses `conn` for replies and events without subscribing.
    pub fn attach(&self, conn: BoxedConnection) {
        *self.shared.conn.write() = Some(conn);
    }

    /// The attached connection.
    pub fn connection(&self) -> Option<BoxedConnection> {
        self.shared.conn.read().clone()
    }

    /// Publishes a raw payload on the attached connection.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        let conn = self.connection().ok_or(TransportError::NotConnected)?;
        conn.publish(subject, payload).await
    }

    // =========================================================================
    // Serving
    // =========================================================================

    /// Subscribes to the request subjects on `conn` and starts dispatching.
    ///
    /// Returns once the subscriptions are in place. Unless disabled, a
    /// `system.reset` event for the owned patterns is published.
    pub async fn serve(&self, conn: BoxedConnection) -> ServiceResult<()> {
        if self.shared.serving.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyServing);
        }
        self.attach(conn.clone());

        let queue_group = self.shared.options.queue_group.as_deref();
        for (kind, subject) in request_subscriptions(&self.shared.name) {
            let sub = match conn.subscribe(&subject, queue_group).await {
                Ok(sub) => sub,
                Err(e) => {
                    self.shared.serving.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            };
            debug!(subject = %subject, kind = %kind, "Subscribed to requests");
            let handle = tokio::spawn(self.clone().consume(sub));
            self.shared.loops.lock().push(handle);
        }

        if !self.shared.options.no_reset_on_serve {
            let (resources, access) = self.owned_patterns();
            if let Err(e) = self.reset(resources, access).await {
                warn!(service = %self.shared.name, error = %e, "Failed to publish reset");
            }
        }

        for hook in &self.shared.on_serve {
            hook(self);
        }
        info!(
            service = %self.shared.name,
            patterns = self.shared.router.len(),
            "Service serving"
        );
        Ok(())
    }

    async fn consume(self, mut sub: Subscription) {
        let subject = sub.subject().to_string();
        let token = self.shared.shutdown.clone();
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                msg = sub.next() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.dispatch(msg).await {
                            warn!(subject = %subject, error = %e, "Request dispatch failed");
                        }
                    }
                    None => {
                        debug!(subject = %subject, "Subscription closed");
                        break;
                    }
                },
            }
        }
    }

    /// Stops consuming requests and waits until every group lane drained.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let loops = std::mem::take(&mut *self.shared.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Subscription loop ended abnormally");
            }
        }
        self.shared.scheduler.idle().await;
        self.shared.serving.store(false, Ordering::SeqCst);

        if let Some(conn) = self.connection()
            && let Err(e) = conn.flush().await
        {
            warn!(error = %e, "Failed to flush connection");
        }
        for hook in &self.shared.on_shutdown {
            hook(self);
        }
        info!(service = %self.shared.name, "Service stopped");
    }

    /// Waits until every group lane is idle.
    pub async fn idle(&self) {
        self.shared.scheduler.idle().await;
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Handles one inbound request message.
    ///
    /// Returns once the request is queued on its group lane, not when it is
    /// answered. Every failure before that point is answered directly.
    pub async fn dispatch(&self, msg: InboundMessage) -> ServiceResult<()> {
        let span = span!(
            Level::DEBUG,
            "request",
            subject = %msg.subject,
            kind = field::Empty,
            rid = field::Empty
        );
        self.dispatch_inner(msg).instrument(span).await
    }

    async fn dispatch_inner(&self, msg: InboundMessage) -> ServiceResult<()> {
        let InboundMessage {
            subject,
            reply,
            payload,
        } = msg;
        let conn = self.connection();

        let RequestSubject {
            kind,
            resource_name,
            method,
        } = match RequestSubject::parse(&subject) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Invalid request subject");
                let core = RequestCore::bus(RequestKind::Get, None, RequestEnvelope::default(), conn, reply);
                core.reply(Outcome::Error(ResError::not_found())).await;
                return Ok(());
            }
        };
        let span = Span::current();
        span.record("kind", field::display(kind));
        span.record("rid", resource_name.as_str());

        let (envelope, decode_error) = match RequestEnvelope::decode(&payload) {
            Ok(envelope) => (envelope, None),
            Err(e) => (RequestEnvelope::default(), Some(e)),
        };
        let core = RequestCore::bus(kind, method.clone(), envelope, conn, reply);
        if let Some(e) = decode_error {
            warn!(rid = %resource_name, error = %e, "Malformed request payload");
            core.reply(Outcome::Error(ResError::internal_from(e))).await;
            return Ok(());
        }

        let Some(route) = self.shared.router.resolve(&resource_name) else {
            debug!(rid = %resource_name, kind = %kind, "No handler for resource");
            core.reply(Outcome::Error(ResError::not_found())).await;
            return Ok(());
        };
        core.advance(RequestState::Dispatching);
        let entry = route.entry.clone();

        if !entry.capabilities().allows(kind) {
            trace!(rid = %resource_name, kind = %kind, "Capability missing, answering directly");
            match kind {
                RequestKind::Get => {
                    core.reply(Outcome::Error(ResError::not_found())).await;
                }
                RequestKind::Call | RequestKind::Auth => {
                    core.reply(Outcome::Error(ResError::method_not_found())).await;
                }
                RequestKind::Access => match self.shared.options.access_fallback {
                    AccessFallback::PassThrough => core.close(),
                    AccessFallback::Deny => {
                        core.reply(Outcome::Frame(frame::ACCESS_DENIED.to_vec())).await;
                    }
                    AccessFallback::Grant => {
                        core.reply(Outcome::Frame(frame::ACCESS_GRANTED.to_vec())).await;
                    }
                },
            }
            return Ok(());
        }

        let query = core.envelope().query.clone().filter(|q| !q.is_empty());
        let group = route.group;
        let resource = Resource::new(
            self.clone(),
            resource_name,
            route.params,
            route.tail,
            query,
            group.clone(),
            entry.clone(),
            true,
        );
        let rid = resource.resource_name().to_string();
        let method = method.unwrap_or_default();
        let task_core = core.clone();

        let task: Task = match kind {
            RequestKind::Access => {
                let Some(f) = entry.access.clone() else {
                    core.reply(Outcome::Error(ResError::not_found())).await;
                    return Ok(());
                };
                let req = AccessRequest::new(core.clone(), resource);
                Box::pin(async move { run_handler(&task_core, &rid, f.call(req)).await })
            }
            RequestKind::Get => {
                let Some(f) = entry.get.clone() else {
                    core.reply(Outcome::Error(ResError::not_found())).await;
                    return Ok(());
                };
                let req = GetRequest::new(core.clone(), resource);
                Box::pin(async move { run_handler(&task_core, &rid, f.call(req)).await })
            }
            RequestKind::Call => {
                let Some(f) = entry.call_method(&method) else {
                    debug!(rid = %rid, method = %method, "No call method");
                    core.reply(Outcome::Error(ResError::method_not_found())).await;
                    return Ok(());
                };
                let req = CallRequest::new(core.clone(), resource);
                Box::pin(async move { run_handler(&task_core, &rid, f.call(req)).await })
            }
            RequestKind::Auth => {
                let Some(f) = entry.auth_method(&method) else {
                    debug!(rid = %rid, method = %method, "No auth method");
                    core.reply(Outcome::Error(ResError::method_not_found())).await;
                    return Ok(());
                };
                let req = AuthRequest::new(core.clone(), resource);
                Box::pin(async move { run_handler(&task_core, &rid, f.call(req)).await })
            }
        };
        let task: Task = Box::pin(task.instrument(Span::current()));

        if let Err(e) = self.shared.scheduler.enqueue(group, task).await {
            warn!(error = %e, "Request rejected by scheduler");
            core.reply(Outcome::Error(ResError::internal_from(&e))).await;
            return Err(e.into());
        }
        Ok(())
    }

    // =========================================================================
    // Out-of-request work
    // =========================================================================

    /// Returns a detached context for the resource `rid`, which may carry a
    /// `?query`.
    ///
    /// Use it for in-process reads with [`Resource::value`]. Its event
    /// methods fail with [`EventError::Detached`]; emit events through
    /// [`with`](Self::with) instead.
    pub fn resource(&self, rid: &str) -> ServiceResult<Resource> {
        self.resolve_resource(rid, false)
    }

    pub(crate) fn resolve_resource(&self, rid: &str, on_lane: bool) -> ServiceResult<Resource> {
        let (name, query) = match rid.split_once('?') {
            Some((name, query)) => (name, (!query.is_empty()).then(|| query.to_string())),
            None => (rid, None),
        };
        validate_resource_name(name).map_err(ServiceError::InvalidResourceName)?;
        let route = self
            .shared
            .router
            .resolve(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        Ok(Resource::new(
            self.clone(),
            name.to_string(),
            route.params,
            route.tail,
            query,
            route.group,
            route.entry,
            on_lane,
        ))
    }

    /// Runs `f` with the resource `rid` on the resource's group lane.
    ///
    /// Returns once `f` is queued.
    pub async fn with<F, Fut>(&self, rid: &str, f: F) -> ServiceResult<()>
    where
        F: FnOnce(Resource) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let resource = self.resolve_resource(rid, true)?;
        let group = resource.group().to_string();
        self.shared
            .scheduler
            .enqueue(group, Box::pin(async move { f(resource).await }))
            .await?;
        Ok(())
    }

    /// Runs `f` on the lane of an explicit group key.
    pub async fn with_group<F, Fut>(&self, group: impl Into<String>, f: F) -> ServiceResult<()>
    where
        F: FnOnce(Service) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service = self.clone();
        self.shared
            .scheduler
            .enqueue(group, Box::pin(async move { f(service).await }))
            .await?;
        Ok(())
    }

    // =========================================================================
    // System events
    // =========================================================================

    /// Sets the access token of connection `cid`.
    pub async fn token_event<T: Serialize + ?Sized>(&self, cid: &str, token: &T) -> EventResult<()> {
        if cid.is_empty() {
            return Err(EventError::MissingCid);
        }
        if cid.contains(['.', '*', '>', ' ']) {
            return Err(EventError::InvalidCid(cid.to_string()));
        }
        let token = serde_json::to_value(token).map_err(|e| EventError::Encode(e.to_string()))?;
        let payload =
            serde_json::to_vec(&TokenEvent { token }).map_err(|e| EventError::Encode(e.to_string()))?;
        debug!(cid = %cid, "Publishing token event");
        self.publish(&token_subject(cid), payload).await?;
        Ok(())
    }

    /// Tells the gateway to drop cached resources and access matching the
    /// given patterns. Nothing is published if both lists are empty.
    pub async fn reset(&self, resources: Vec<String>, access: Vec<String>) -> EventResult<()> {
        let event = ResetEvent { resources, access };
        if event.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(&event).map_err(|e| EventError::Encode(e.to_string()))?;
        debug!(resources = ?event.resources, access = ?event.access, "Publishing system reset");
        self.publish(SYSTEM_RESET_SUBJECT, payload).await?;
        Ok(())
    }

    fn owned_patterns(&self) -> (Vec<String>, Vec<String>) {
        let default = if self.shared.name.is_empty() {
            ">".to_string()
        } else {
            format!("{}.>", self.shared.name)
        };
        let options = &self.shared.options;
        (
            options
                .owned_resources
                .clone()
                .unwrap_or_else(|| vec![default.clone()]),
            options.owned_access.clone().unwrap_or_else(|| vec![default]),
        )
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.shared.name)
            .field("router", &self.shared.router)
            .field("serving", &self.is_serving())
            .finish()
    }
}

impl tower::Service<InboundMessage> for Service {
    type Response = ();
    type Error = ServiceError;
    type Future = BoxFuture<'static, ServiceResult<()>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, msg: InboundMessage) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.dispatch(msg).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;
    use crate::scheduler::OverflowPolicy;
    use crate::testing::MockConnection;
    use resmesh_core::{ResponseFrame, delete_action};
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tower::ServiceExt;

    fn request(subject: &str, reply: &str, payload: Value) -> InboundMessage {
        InboundMessage::new(subject, Some(reply.to_string()), serde_json::to_vec(&payload).unwrap())
    }

    async fn get_book(req: GetRequest) -> HandlerResult {
        let id = req.path_param("id").unwrap_or_default().to_string();
        req.model(&json!({"id": id})).await;
        Ok(())
    }

    async fn set_book(req: CallRequest) -> HandlerResult {
        #[derive(serde::Deserialize)]
        struct Params {
            title: String,
        }
        let params: Params = req.parse_params()?;
        let mut changes = serde_json::Map::new();
        changes.insert("title".into(), json!(params.title));
        req.change_event(changes).await?;
        req.ok_empty().await;
        Ok(())
    }

    async fn fallback(req: CallRequest) -> HandlerResult {
        let method = req.method().to_string();
        req.ok(&json!({"fallback": method})).await;
        Ok(())
    }

    async fn login(req: AuthRequest) -> HandlerResult {
        req.token_event(&json!({"user": "ann"})).await?;
        req.ok(&json!({"host": req.host()})).await;
        Ok(())
    }

    async fn deny(req: AccessRequest) -> HandlerResult {
        req.access_denied().await;
        Ok(())
    }

    async fn access_only(req: AccessRequest) -> HandlerResult {
        req.access_granted().await;
        Ok(())
    }

    fn library(conn: &Arc<MockConnection>) -> Service {
        let service = Service::builder("library")
            .handle(
                "book.$id",
                Handler::new()
                    .get_model(get_book)
                    .access(deny)
                    .call("set", set_book)
                    .call_fallback(fallback),
            )
            .unwrap()
            .handle("auth", Handler::new().auth("login", login))
            .unwrap()
            .handle("secret", Handler::new().access(access_only))
            .unwrap()
            .handle("strict.$id", Handler::new().call("set", set_book))
            .unwrap()
            .build()
            .unwrap();
        service.attach(conn.clone());
        service
    }

    #[tokio::test]
    async fn test_get_and_call_round_trip() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .dispatch(request("get.library.book.7", "r1", json!({})))
            .await
            .unwrap();
        service
            .dispatch(request("call.library.book.7.set", "r2", json!({"params": {"title": "Dune"}})))
            .await
            .unwrap();
        service.idle().await;

        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Result(json!({"model": {"id": "7"}}))]
        );
        assert_eq!(conn.replies("r2"), vec![ResponseFrame::Result(Value::Null)]);
        assert_eq!(conn.published_on("event.library.book.7.change").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .dispatch(request("get.library.nothing", "r1", json!({})))
            .await
            .unwrap();
        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Error(ResError::not_found())]
        );
    }

    #[tokio::test]
    async fn test_missing_capability_answers_without_handler() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .dispatch(request("get.library.secret", "r1", json!({})))
            .await
            .unwrap();
        service
            .dispatch(request("auth.library.secret.login", "r2", json!({})))
            .await
            .unwrap();
        service
            .dispatch(request("access.library.strict.1", "r3", json!({})))
            .await
            .unwrap();
        service.idle().await;

        assert_eq!(conn.replies("r1"), vec![ResponseFrame::Error(ResError::not_found())]);
        assert_eq!(
            conn.replies("r2"),
            vec![ResponseFrame::Error(ResError::method_not_found())]
        );
        assert!(conn.replies("r3").is_empty());
    }

    #[tokio::test]
    async fn test_access_fallback_policy() {
        let conn = MockConnection::new();
        let service = Service::builder("library")
            .handle("strict.$id", Handler::new().call("set", set_book))
            .unwrap()
            .options(ServiceOptions::new().access_fallback(AccessFallback::Deny))
            .build()
            .unwrap();
        service.attach(conn.clone());

        service
            .dispatch(request("access.library.strict.1", "r1", json!({})))
            .await
            .unwrap();
        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Error(ResError::access_denied())]
        );
    }

    #[tokio::test]
    async fn test_call_method_resolution() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .dispatch(request("call.library.book.1.foo", "r1", json!({})))
            .await
            .unwrap();
        service
            .dispatch(request("call.library.strict.1.foo", "r2", json!({})))
            .await
            .unwrap();
        service
            .dispatch(request("call.library.book.1.set", "r3", json!({"params": {"title": 5}})))
            .await
            .unwrap();
        service.idle().await;

        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Result(json!({"fallback": "foo"}))]
        );
        assert_eq!(
            conn.replies("r2"),
            vec![ResponseFrame::Error(ResError::method_not_found())]
        );
        match conn.replies("r3").as_slice() {
            [ResponseFrame::Error(err)] => assert!(err.is(resmesh_core::CODE_INVALID_PARAMS)),
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_publishes_token_on_connection_subject() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .dispatch(request(
                "auth.library.auth.login",
                "r1",
                json!({"cid": "c42", "host": "example.org"}),
            ))
            .await
            .unwrap();
        service.idle().await;

        assert_eq!(
            conn.published_on("conn.c42.token"),
            vec![br#"{"token":{"user":"ann"}}"#.to_vec()]
        );
        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Result(json!({"host": "example.org"}))]
        );
    }

    #[tokio::test]
    async fn test_access_handler_runs() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .dispatch(request("access.library.book.1", "r1", json!({})))
            .await
            .unwrap();
        service
            .dispatch(request("access.library.secret", "r2", json!({})))
            .await
            .unwrap();
        service.idle().await;

        assert_eq!(conn.replies("r1"), vec![ResponseFrame::Error(ResError::access_denied())]);
        assert_eq!(
            conn.replies("r2"),
            vec![ResponseFrame::Result(json!({"get": true, "call": "*"}))]
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_internal_error() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .dispatch(InboundMessage::new("get.library.book.1", Some("r1".into()), b"{nope".to_vec()))
            .await
            .unwrap();
        match conn.replies("r1").as_slice() {
            [ResponseFrame::Error(err)] => assert!(err.is(resmesh_core::CODE_INTERNAL_ERROR)),
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_same_group_requests_do_not_interleave() {
        let conn = MockConnection::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let handler = {
            let log = log.clone();
            let active = active.clone();
            move |req: CallRequest| {
                let log = log.clone();
                let active = active.clone();
                async move {
                    let id = req.path_param("id").unwrap_or_default().to_string();
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    log.lock().push(format!("{id}:{}", req.method()));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    req.ok_empty().await;
                    HandlerResult::Ok(())
                }
            }
        };
        let service = Service::builder("library")
            .handle(
                "shelf.$shelf.book.$id",
                Handler::new().call_fallback(handler).group("shelf.${shelf}"),
            )
            .unwrap()
            .build()
            .unwrap();
        service.attach(conn.clone());

        for (i, rid) in ["1", "2", "1", "3"].iter().enumerate() {
            service
                .dispatch(request(
                    &format!("call.library.shelf.9.book.{rid}.m{i}"),
                    &format!("r{i}"),
                    json!({}),
                ))
                .await
                .unwrap();
        }
        service.idle().await;

        assert_eq!(*log.lock(), vec!["1:m0", "2:m1", "1:m2", "3:m3"]);
    }

    #[tokio::test]
    async fn test_with_runs_on_resource_lane() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .with("library.book.5", |resource| async move {
                let mut changes = serde_json::Map::new();
                changes.insert("title".into(), delete_action());
                let _ = resource.change_event(changes).await;
            })
            .await
            .unwrap();
        service.idle().await;

        assert_eq!(conn.published_on("event.library.book.5.change").len(), 1);
        assert!(matches!(
            service.with("library.nothing", |_| async {}).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_full_is_answered() {
        let conn = MockConnection::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let service = Service::builder("library")
            .handle("book.$id", Handler::new().get_model(get_book))
            .unwrap()
            .options(ServiceOptions::new().max_queue_depth(1, OverflowPolicy::Reject))
            .build()
            .unwrap();
        service.attach(conn.clone());

        let blocker = gate.clone();
        service
            .with_group("library.book.1", move |_| async move { blocker.notified().await })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        service
            .dispatch(request("get.library.book.1", "r1", json!({})))
            .await
            .unwrap();
        let rejected = service
            .dispatch(request("get.library.book.1", "r2", json!({})))
            .await;
        assert!(matches!(rejected, Err(ServiceError::Scheduler(_))));

        gate.notify_one();
        service.idle().await;
        assert_eq!(conn.replies("r1").len(), 1);
        match conn.replies("r2").as_slice() {
            [ResponseFrame::Error(err)] => assert!(err.is(resmesh_core::CODE_INTERNAL_ERROR)),
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serve_subscribes_and_resets() {
        let conn = MockConnection::new();
        let served = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let (s, t) = (served.clone(), stopped.clone());
        let service = Service::builder("library")
            .handle("book.$id", Handler::new().get_model(get_book))
            .unwrap()
            .on_serve(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_shutdown(move |_| {
                t.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        service.serve(conn.clone()).await.unwrap();
        assert!(matches!(
            service.serve(conn.clone()).await,
            Err(ServiceError::AlreadyServing)
        ));
        assert_eq!(
            conn.subscriptions(),
            vec!["access.library.>", "get.library.>", "call.library.>", "auth.library.>"]
        );
        assert_eq!(
            conn.published_on(SYSTEM_RESET_SUBJECT),
            vec![br#"{"resources":["library.>"],"access":["library.>"]}"#.to_vec()]
        );

        conn.inject(request("get.library.book.3", "r1", json!({}))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.shutdown().await;

        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Result(json!({"model": {"id": "3"}}))]
        );
        assert_eq!(served.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!service.is_serving());
    }

    #[tokio::test]
    async fn test_tower_service_dispatches() {
        let conn = MockConnection::new();
        let service = library(&conn);

        service
            .clone()
            .oneshot(request("get.library.book.2", "r1", json!({})))
            .await
            .unwrap();
        service.idle().await;

        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Result(json!({"model": {"id": "2"}}))]
        );
    }

    #[test]
    fn test_invalid_service_name() {
        assert!(matches!(
            Service::builder("lib.*").build(),
            Err(RegistrationError::InvalidServiceName(_))
        ));
        assert!(Service::builder("").build().is_ok());
    }
}
