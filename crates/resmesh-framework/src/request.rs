//! Requests and the reply state machine.
//!
//! Every inbound request moves through
//!
//! ```text
//! Received → Dispatching → HandlerRunning → Responded → Closed
//!                               │    ▲
//!                               ▼    │
//!                          TimeoutExtended
//! ```
//!
//! Exactly one terminal reply is sent per request. A second reply is logged
//! and discarded. Timeout frames only advise the caller to wait longer and are
//! ignored once the terminal reply is out.
//!
//! Handlers receive a view restricted to their request kind
//! ([`AccessRequest`], [`GetRequest`], [`CallRequest`], [`AuthRequest`]). Each
//! view dereferences to the [`Resource`] it targets.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use resmesh_core::{BoxedConnection, RequestEnvelope, RequestKind, ResError, frame};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::EventResult;
use crate::handler::{BoxFuture, HandlerResult, ResourceType};
use crate::resource::Resource;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Decoded, not yet routed.
    Received,
    /// Routed and waiting on its group lane.
    Dispatching,
    /// The handler function is running.
    HandlerRunning,
    /// At least one timeout frame has been sent.
    TimeoutExtended,
    /// The terminal reply has been sent.
    Responded,
    /// The request is finished.
    Closed,
}

impl RequestState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Responded | Self::Closed)
    }
}

/// A terminal reply before encoding.
pub(crate) enum Outcome {
    /// A pre-encoded frame.
    Frame(Vec<u8>),
    /// A get result.
    Get {
        value: Value,
        collection: bool,
        query: Option<String>,
    },
    /// An error frame.
    Error(ResError),
}

enum ReplySink {
    Bus {
        conn: Option<BoxedConnection>,
        reply: Option<String>,
    },
    Value(Mutex<Option<Result<Value, ResError>>>),
}

/// Shared state behind every request view.
pub(crate) struct RequestCore {
    kind: RequestKind,
    method: Option<String>,
    envelope: RequestEnvelope,
    state: Mutex<RequestState>,
    sink: ReplySink,
}

impl RequestCore {
    /// A request received from the bus.
    pub(crate) fn bus(
        kind: RequestKind,
        method: Option<String>,
        envelope: RequestEnvelope,
        conn: Option<BoxedConnection>,
        reply: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            method,
            envelope,
            state: Mutex::new(RequestState::Received),
            sink: ReplySink::Bus { conn, reply },
        })
    }

    /// An in-process get whose result is captured instead of published.
    pub(crate) fn for_value(query: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            kind: RequestKind::Get,
            method: None,
            envelope: RequestEnvelope {
                query,
                ..Default::default()
            },
            state: Mutex::new(RequestState::Received),
            sink: ReplySink::Value(Mutex::new(None)),
        })
    }

    pub(crate) fn kind(&self) -> RequestKind {
        self.kind
    }

    pub(crate) fn envelope(&self) -> &RequestEnvelope {
        &self.envelope
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock()
    }

    /// Moves to a non-terminal state. Has no effect after the reply.
    pub(crate) fn advance(&self, next: RequestState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
    }

    pub(crate) fn is_replied(&self) -> bool {
        self.state().is_terminal()
    }

    pub(crate) fn is_for_value(&self) -> bool {
        matches!(self.sink, ReplySink::Value(_))
    }

    /// Ends the request. No reply can be sent afterwards.
    pub(crate) fn close(&self) {
        *self.state.lock() = RequestState::Closed;
    }

    /// Sends the terminal reply. A second attempt is logged and discarded.
    pub(crate) async fn reply(&self, outcome: Outcome) -> bool {
        self.reply_inner(outcome, true).await
    }

    /// Sends the terminal reply unless one was already sent.
    pub(crate) async fn reply_if_unreplied(&self, outcome: Outcome) -> bool {
        self.reply_inner(outcome, false).await
    }

    async fn reply_inner(&self, outcome: Outcome, report_duplicate: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                if report_duplicate {
                    error!(
                        kind = %self.kind,
                        method = self.method.as_deref().unwrap_or(""),
                        "Duplicate reply discarded"
                    );
                }
                return false;
            }
            *state = RequestState::Responded;
        }

        match &self.sink {
            ReplySink::Bus { conn, reply } => {
                let payload = match outcome {
                    Outcome::Frame(payload) => payload,
                    Outcome::Get {
                        value,
                        collection: true,
                        query,
                    } => frame::collection(&value, query.as_deref()),
                    Outcome::Get { value, query, .. } => frame::model(&value, query.as_deref()),
                    Outcome::Error(err) => frame::error(&err),
                };
                let (Some(conn), Some(reply)) = (conn, reply) else {
                    debug!(kind = %self.kind, "No reply subject, reply dropped");
                    return true;
                };
                if let Err(e) = conn.publish(reply, payload).await {
                    error!(kind = %self.kind, error = %e, "Failed to publish reply");
                }
            }
            ReplySink::Value(slot) => {
                let result = match outcome {
                    Outcome::Get { value, .. } => Ok(value),
                    Outcome::Error(err) => Err(err),
                    Outcome::Frame(_) => Err(ResError::internal_from("unexpected reply to a value read")),
                };
                *slot.lock() = Some(result);
            }
        }
        true
    }

    /// Sends a timeout frame unless the request is already answered.
    pub(crate) async fn timeout(&self, duration: Duration) {
        let ReplySink::Bus {
            conn: Some(conn),
            reply: Some(reply),
        } = &self.sink
        else {
            return;
        };
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                debug!(kind = %self.kind, "Timeout after reply ignored");
                return;
            }
            *state = RequestState::TimeoutExtended;
        }
        if let Err(e) = conn.publish(reply, frame::timeout(duration)).await {
            warn!(kind = %self.kind, error = %e, "Failed to publish timeout");
        }
    }

    /// Takes the captured result of a value read.
    pub(crate) fn take_value(&self) -> Option<Result<Value, ResError>> {
        match &self.sink {
            ReplySink::Value(slot) => slot.lock().take(),
            ReplySink::Bus { .. } => None,
        }
    }
}

/// Runs a handler future and enforces the single-reply rule on its outcome.
///
/// Structured errors become their error frame, other errors and panics become
/// `system.internalError`. Faults are logged even when a reply was already
/// sent. A bus request that completes without replying gets an internal error.
pub(crate) async fn run_handler(core: &RequestCore, rid: &str, handler: BoxFuture<'static, HandlerResult>) {
    core.advance(RequestState::HandlerRunning);

    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(())) => {
            if !core.is_replied() && !core.is_for_value() {
                warn!(rid = %rid, kind = %core.kind(), "Handler returned without a reply");
                core.reply_if_unreplied(Outcome::Error(ResError::internal_from("missing response")))
                    .await;
            }
        }
        Ok(Err(err)) => match err.downcast::<ResError>() {
            Ok(res_err) => {
                debug!(rid = %rid, kind = %core.kind(), code = %res_err.code, "Handler returned an error");
                if !core.reply_if_unreplied(Outcome::Error(res_err)).await {
                    warn!(rid = %rid, kind = %core.kind(), "Handler error after reply");
                }
            }
            Err(err) => {
                error!(rid = %rid, kind = %core.kind(), error = %err, "Handler failed");
                core.reply_if_unreplied(Outcome::Error(ResError::internal_from(&err)))
                    .await;
            }
        },
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(rid = %rid, kind = %core.kind(), panic = %message, "Handler panicked");
            core.reply_if_unreplied(Outcome::Error(ResError::internal_from(message)))
                .await;
        }
    }

    if !core.is_for_value() {
        core.close();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Serializes a reply value, logging failures.
fn to_reply_value<T: Serialize + ?Sized>(kind: RequestKind, value: &T) -> Result<Value, ResError> {
    serde_json::to_value(value).map_err(|e| {
        error!(kind = %kind, error = %e, "Failed to serialize reply");
        ResError::internal_from(e)
    })
}

// =============================================================================
// Request views
// =============================================================================

macro_rules! request_view {
    ($view:ident) => {
        impl $view {
            pub(crate) fn new(core: Arc<RequestCore>, resource: Resource) -> Self {
                Self { core, resource }
            }

            /// Connection ID of the requesting client.
            pub fn cid(&self) -> Option<&str> {
                self.core.envelope().cid.as_deref()
            }

            /// Access token of the requesting connection.
            pub fn raw_token(&self) -> Option<&Value> {
                self.core.envelope().token.as_ref()
            }

            /// Deserializes the access token. An absent or null token is `None`.
            pub fn parse_token<T: DeserializeOwned>(&self) -> Result<Option<T>, ResError> {
                match self.raw_token() {
                    None | Some(Value::Null) => Ok(None),
                    Some(token) => serde_json::from_value(token.clone())
                        .map(Some)
                        .map_err(ResError::internal_from),
                }
            }

            /// The resource this request targets.
            pub fn resource(&self) -> &Resource {
                &self.resource
            }

            /// Current lifecycle state.
            pub fn state(&self) -> RequestState {
                self.core.state()
            }

            /// Returns `true` once the terminal reply was sent.
            pub fn is_replied(&self) -> bool {
                self.core.is_replied()
            }

            /// Replies with an error.
            pub async fn error(&self, err: ResError) {
                self.core.reply(Outcome::Error(err)).await;
            }

            /// Replies with `system.notFound`.
            pub async fn not_found(&self) {
                self.error(ResError::not_found()).await;
            }

            /// Asks the caller to wait `duration` for the reply.
            pub async fn timeout(&self, duration: Duration) {
                self.core.timeout(duration).await;
            }
        }

        impl Deref for $view {
            type Target = Resource;

            fn deref(&self) -> &Resource {
                &self.resource
            }
        }

        impl fmt::Debug for $view {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($view))
                    .field("rid", &self.resource.resource_name())
                    .field("cid", &self.cid())
                    .field("state", &self.state())
                    .finish()
            }
        }
    };
}

macro_rules! method_view {
    ($view:ident) => {
        impl $view {
            /// The called method.
            pub fn method(&self) -> &str {
                self.core.method.as_deref().unwrap_or_default()
            }

            /// Raw method parameters.
            pub fn raw_params(&self) -> Option<&Value> {
                self.core.envelope().params.as_ref()
            }

            /// Deserializes the method parameters.
            ///
            /// Absent parameters deserialize from `null`. Failures map to
            /// `system.invalidParams`, so they can be returned with `?`.
            pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, ResError> {
                let params = self.raw_params().cloned().unwrap_or(Value::Null);
                serde_json::from_value(params).map_err(|e| {
                    ResError::new(resmesh_core::CODE_INVALID_PARAMS, format!("Invalid parameters: {e}"))
                })
            }

            /// Replies with a result.
            pub async fn ok<T: Serialize + ?Sized>(&self, result: &T) {
                let outcome = match frame::result(result) {
                    Ok(payload) => Outcome::Frame(payload),
                    Err(e) => {
                        error!(method = self.method(), error = %e, "Failed to serialize result");
                        Outcome::Error(ResError::internal_from(e))
                    }
                };
                self.core.reply(outcome).await;
            }

            /// Replies with an empty success.
            pub async fn ok_empty(&self) {
                self.core
                    .reply(Outcome::Frame(frame::EMPTY_SUCCESS.to_vec()))
                    .await;
            }

            /// Replies with a reference to a resource, e.g. one just created.
            pub async fn resource_ref(&self, rid: &str) {
                self.core.reply(Outcome::Frame(frame::resource(rid))).await;
            }

            /// Replies with `system.methodNotFound`.
            pub async fn method_not_found(&self) {
                self.error(ResError::method_not_found()).await;
            }

            /// Replies with `system.invalidParams`.
            pub async fn invalid_params(&self, message: impl Into<String>) {
                let message = message.into();
                let err = if message.is_empty() {
                    ResError::invalid_params()
                } else {
                    ResError::new(resmesh_core::CODE_INVALID_PARAMS, message)
                };
                self.error(err).await;
            }
        }
    };
}

/// An access request.
pub struct AccessRequest {
    core: Arc<RequestCore>,
    resource: Resource,
}

request_view!(AccessRequest);

impl AccessRequest {
    /// Replies with the granted access. `call` is a comma-separated list of
    /// methods, `*` for all, or empty for none.
    pub async fn access(&self, get: bool, call: &str) {
        self.core.reply(Outcome::Frame(frame::access(get, call))).await;
    }

    /// Grants get and every call method.
    pub async fn access_granted(&self) {
        self.core
            .reply(Outcome::Frame(frame::ACCESS_GRANTED.to_vec()))
            .await;
    }

    /// Denies access.
    pub async fn access_denied(&self) {
        self.core
            .reply(Outcome::Frame(frame::ACCESS_DENIED.to_vec()))
            .await;
    }
}

/// A get request, from a client or from an in-process value read.
pub struct GetRequest {
    core: Arc<RequestCore>,
    resource: Resource,
}

request_view!(GetRequest);

impl GetRequest {
    /// Returns `true` if this is an in-process read by
    /// [`Resource::value`] rather than a client get.
    pub fn for_value(&self) -> bool {
        self.core.is_for_value()
    }

    /// Replies with a model.
    pub async fn model<T: Serialize + ?Sized>(&self, model: &T) {
        self.reply_get(model, false, None).await;
    }

    /// Replies with the model variant for the request's query.
    pub async fn query_model<T: Serialize + ?Sized>(&self, model: &T, normalized_query: &str) {
        self.reply_get(model, false, Some(normalized_query)).await;
    }

    /// Replies with a collection.
    pub async fn collection<T: Serialize + ?Sized>(&self, collection: &T) {
        self.reply_get(collection, true, None).await;
    }

    /// Replies with the collection variant for the request's query.
    pub async fn query_collection<T: Serialize + ?Sized>(&self, collection: &T, normalized_query: &str) {
        self.reply_get(collection, true, Some(normalized_query)).await;
    }

    /// Replies with `system.invalidQuery`.
    pub async fn invalid_query(&self, message: impl Into<String>) {
        let message = message.into();
        let err = if message.is_empty() {
            ResError::invalid_query()
        } else {
            ResError::new(resmesh_core::CODE_INVALID_QUERY, message)
        };
        self.error(err).await;
    }

    async fn reply_get<T: Serialize + ?Sized>(&self, value: &T, collection: bool, query: Option<&str>) {
        let declared = self.resource.entry().resource_type();
        let expected = if collection {
            ResourceType::Collection
        } else {
            ResourceType::Model
        };
        if declared != ResourceType::Unknown && declared != expected {
            error!(
                rid = %self.resource.resource_name(),
                declared = ?declared,
                "Get reply does not match the resource type"
            );
            self.error(ResError::internal_from("reply does not match the resource type"))
                .await;
            return;
        }

        if query.is_some() && self.query().is_none_or(str::is_empty) {
            error!(
                rid = %self.resource.resource_name(),
                "Query reply to a request without query"
            );
            self.error(ResError::internal_from("query reply to a request without query"))
                .await;
            return;
        }

        let outcome = match to_reply_value(self.core.kind(), value) {
            Ok(value) => Outcome::Get {
                value,
                collection,
                query: query.map(str::to_string),
            },
            Err(err) => Outcome::Error(err),
        };
        self.core.reply(outcome).await;
    }
}

/// A call request.
pub struct CallRequest {
    core: Arc<RequestCore>,
    resource: Resource,
}

request_view!(CallRequest);
method_view!(CallRequest);

/// An auth request.
pub struct AuthRequest {
    core: Arc<RequestCore>,
    resource: Resource,
}

request_view!(AuthRequest);
method_view!(AuthRequest);

impl AuthRequest {
    /// HTTP headers of the client connection.
    pub fn header(&self) -> Option<&std::collections::HashMap<String, Vec<String>>> {
        self.core.envelope().header.as_ref()
    }

    /// Host of the client connection.
    pub fn host(&self) -> Option<&str> {
        self.core.envelope().host.as_deref()
    }

    /// Remote address of the client connection.
    pub fn remote_addr(&self) -> Option<&str> {
        self.core.envelope().remote_addr.as_deref()
    }

    /// Request URI of the client connection.
    pub fn uri(&self) -> Option<&str> {
        self.core.envelope().uri.as_deref()
    }

    /// Sets the access token of the requesting connection.
    ///
    /// The token is published on the connection's token subject, not as the
    /// reply of this request.
    pub async fn token_event<T: Serialize + ?Sized>(&self, token: &T) -> EventResult<()> {
        let cid = self.cid().ok_or(crate::error::EventError::MissingCid)?;
        self.resource.service().token_event(cid, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::service::Service;
    use crate::testing::{LogCapture, MockConnection};
    use resmesh_core::{CODE_INTERNAL_ERROR, CODE_INVALID_QUERY, InboundMessage, ResponseFrame};
    use serde_json::json;

    async fn out_of_stock() -> HandlerResult {
        Err(ResError::new("library.outOfStock", "Out of stock").into())
    }

    async fn disk_full() -> HandlerResult {
        Err(anyhow::anyhow!("disk full"))
    }

    async fn panicking() -> HandlerResult {
        panic!("boom")
    }

    async fn silent() -> HandlerResult {
        Ok(())
    }

    async fn reply_then_fail(core: Arc<RequestCore>) -> HandlerResult {
        core.reply(Outcome::Frame(frame::result(&json!(1))?)).await;
        Err(anyhow::anyhow!("late failure"))
    }

    fn bus_core(conn: &Arc<MockConnection>) -> Arc<RequestCore> {
        RequestCore::bus(
            RequestKind::Call,
            Some("set".into()),
            RequestEnvelope::default(),
            Some(conn.clone()),
            Some("_INBOX.1".into()),
        )
    }

    #[tokio::test]
    async fn test_second_reply_is_discarded() {
        let conn = MockConnection::new();
        let core = bus_core(&conn);

        assert!(core.reply(Outcome::Frame(frame::EMPTY_SUCCESS.to_vec())).await);
        assert!(!core.reply(Outcome::Error(ResError::not_found())).await);

        let replies = conn.replies("_INBOX.1");
        assert_eq!(replies, vec![ResponseFrame::Result(Value::Null)]);
        assert_eq!(core.state(), RequestState::Responded);
    }

    #[tokio::test]
    async fn test_timeout_before_and_after_reply() {
        let conn = MockConnection::new();
        let core = bus_core(&conn);

        core.timeout(Duration::from_secs(5)).await;
        assert_eq!(core.state(), RequestState::TimeoutExtended);
        core.reply(Outcome::Frame(frame::EMPTY_SUCCESS.to_vec())).await;
        core.timeout(Duration::from_secs(5)).await;

        assert_eq!(
            conn.replies("_INBOX.1"),
            vec![
                ResponseFrame::Timeout(Duration::from_secs(5)),
                ResponseFrame::Result(Value::Null),
            ]
        );
    }

    #[tokio::test]
    async fn test_structured_error_becomes_error_frame() {
        let conn = MockConnection::new();
        let core = bus_core(&conn);

        run_handler(&core, "library.book.1", Box::pin(out_of_stock())).await;

        assert_eq!(
            conn.replies("_INBOX.1"),
            vec![ResponseFrame::Error(ResError::new("library.outOfStock", "Out of stock"))]
        );
        assert_eq!(core.state(), RequestState::Closed);
    }

    #[tokio::test]
    async fn test_unstructured_error_and_panic_become_internal_errors() {
        let conn = MockConnection::new();
        let core = bus_core(&conn);
        run_handler(&core, "library.book.1", Box::pin(disk_full())).await;

        let core2 = RequestCore::bus(
            RequestKind::Get,
            None,
            RequestEnvelope::default(),
            Some(conn.clone()),
            Some("_INBOX.2".into()),
        );
        run_handler(&core2, "library.book.1", Box::pin(panicking())).await;

        assert_eq!(
            conn.replies("_INBOX.1"),
            vec![ResponseFrame::Error(ResError::internal_from("disk full"))]
        );
        assert_eq!(
            conn.replies("_INBOX.2"),
            vec![ResponseFrame::Error(ResError::internal_from("boom"))]
        );
    }

    #[tokio::test]
    async fn test_error_after_reply_keeps_first_reply() {
        let conn = MockConnection::new();
        let core = bus_core(&conn);
        run_handler(&core, "library.book.1", Box::pin(reply_then_fail(core.clone()))).await;

        assert_eq!(conn.replies("_INBOX.1"), vec![ResponseFrame::Result(json!(1))]);
    }

    #[tokio::test]
    async fn test_missing_reply_becomes_internal_error() {
        let conn = MockConnection::new();
        let core = bus_core(&conn);
        run_handler(&core, "library.book.1", Box::pin(silent())).await;

        assert_eq!(
            conn.replies("_INBOX.1"),
            vec![ResponseFrame::Error(ResError::internal_from("missing response"))]
        );
    }

    #[tokio::test]
    async fn test_value_sink_captures_result() {
        let core = RequestCore::for_value(None);
        assert!(core.is_for_value());
        core.reply(Outcome::Get {
            value: json!({"title": "Dune"}),
            collection: false,
            query: None,
        })
        .await;
        assert_eq!(core.take_value(), Some(Ok(json!({"title": "Dune"}))));

        let core = RequestCore::for_value(None);
        run_handler(&core, "library.book.1", Box::pin(silent())).await;
        assert_eq!(core.take_value(), None);
    }

    async fn filtered_model(req: GetRequest) -> HandlerResult {
        match req.query() {
            Some("bad") => req.invalid_query("unknown filter").await,
            _ => req.query_model(&json!({"hits": 1}), "q=dune").await,
        }
        Ok(())
    }

    async fn filtered_collection(req: GetRequest) -> HandlerResult {
        req.query_collection(&json!([1]), "q=dune").await;
        Ok(())
    }

    async fn model_reply(req: GetRequest) -> HandlerResult {
        req.model(&json!({"title": "Dune"})).await;
        Ok(())
    }

    fn catalog(conn: &Arc<MockConnection>) -> Service {
        let service = Service::builder("catalog")
            .handle("search", Handler::new().get_model(filtered_model))
            .unwrap()
            .handle("list", Handler::new().get_collection(filtered_collection))
            .unwrap()
            .handle("shelf", Handler::new().get_collection(model_reply))
            .unwrap()
            .build()
            .unwrap();
        service.attach(conn.clone());
        service
    }

    async fn get(service: &Service, rid: &str, reply: &str, query: Option<&str>) {
        let envelope = RequestEnvelope {
            query: query.map(str::to_string),
            ..Default::default()
        };
        let msg = InboundMessage::new(
            format!("get.{rid}"),
            Some(reply.to_string()),
            envelope.encode().unwrap(),
        );
        service.dispatch(msg).await.unwrap();
        service.idle().await;
    }

    fn error_code(frames: &[ResponseFrame]) -> Option<&str> {
        match frames {
            [ResponseFrame::Error(err)] => Some(err.code.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_query_reply_without_query_is_internal_error() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let conn = MockConnection::new();
        let service = catalog(&conn);

        get(&service, "catalog.search", "r1", None).await;
        get(&service, "catalog.list", "r2", None).await;

        assert_eq!(error_code(&conn.replies("r1")), Some(CODE_INTERNAL_ERROR));
        assert_eq!(error_code(&conn.replies("r2")), Some(CODE_INTERNAL_ERROR));
        assert_eq!(logs.contents().matches("Query reply to a request without query").count(), 2);
    }

    #[tokio::test]
    async fn test_query_reply_with_query() {
        let conn = MockConnection::new();
        let service = catalog(&conn);

        get(&service, "catalog.search", "r1", Some("q=Dune")).await;
        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Result(json!({"model": {"hits": 1}, "query": "q=dune"}))]
        );
    }

    #[tokio::test]
    async fn test_invalid_query_frame() {
        let conn = MockConnection::new();
        let service = catalog(&conn);

        get(&service, "catalog.search", "r1", Some("bad")).await;
        assert_eq!(
            conn.replies("r1"),
            vec![ResponseFrame::Error(ResError::new(CODE_INVALID_QUERY, "unknown filter"))]
        );
    }

    #[tokio::test]
    async fn test_model_reply_from_collection_handler_is_rejected() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let conn = MockConnection::new();
        let service = catalog(&conn);

        get(&service, "catalog.shelf", "r1", None).await;
        assert_eq!(error_code(&conn.replies("r1")), Some(CODE_INTERNAL_ERROR));
        assert!(logs.contents().contains("Get reply does not match the resource type"));
    }
}
