//! The resource context.
//!
//! A [`Resource`] identifies one concrete resource together with the handler
//! serving it. It exposes the routing results (path parameters, wildcard tail,
//! query, group), emits events for the resource, and reads resource values
//! in-process through [`Resource::value`].
//!
//! Event methods first run the handler's apply function for the event, then
//! publish it. They are only available on the resource's group lane: in a
//! request handler of the resource, or through [`Service::with`]. A context
//! from [`Service::resource`] is detached and can only read values.

use std::fmt;
use std::sync::Arc;

use resmesh_core::{PathParams, ResError, ResourceEvent, validate_event_name};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::{EventError, EventResult};
use crate::handler::{HandlerEntry, ResourceType};
use crate::request::{GetRequest, RequestCore, run_handler};
use crate::service::Service;

struct ResourceInner {
    service: Service,
    name: String,
    params: PathParams,
    tail: Option<String>,
    query: Option<String>,
    group: String,
    entry: Arc<HandlerEntry>,
    on_lane: bool,
}

/// A concrete resource and the handler serving it.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    pub(crate) fn new(
        service: Service,
        name: String,
        params: PathParams,
        tail: Option<String>,
        query: Option<String>,
        group: String,
        entry: Arc<HandlerEntry>,
        on_lane: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                service,
                name,
                params,
                tail,
                query,
                group,
                entry,
                on_lane,
            }),
        }
    }

    /// The resource name, without query.
    pub fn resource_name(&self) -> &str {
        &self.inner.name
    }

    /// All path parameters bound by the pattern.
    pub fn path_params(&self) -> &PathParams {
        &self.inner.params
    }

    /// A single path parameter.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name).map(String::as_str)
    }

    /// The segments matched by a trailing `>`, joined by `.`.
    pub fn wildcard_tail(&self) -> Option<&str> {
        self.inner.tail.as_deref()
    }

    /// The query of the request, if any.
    pub fn query(&self) -> Option<&str> {
        self.inner.query.as_deref()
    }

    /// The group lane this resource runs on.
    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// The service owning the resource.
    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    /// Returns `true` if events can be emitted through this context.
    pub fn is_on_lane(&self) -> bool {
        self.inner.on_lane
    }

    /// The handler entry serving the resource.
    pub fn entry(&self) -> &HandlerEntry {
        &self.inner.entry
    }

    /// Returns a copy of this context bound to a different query.
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        let query = query.into();
        let inner = &self.inner;
        Self::new(
            inner.service.clone(),
            inner.name.clone(),
            inner.params.clone(),
            inner.tail.clone(),
            (!query.is_empty()).then_some(query),
            inner.group.clone(),
            inner.entry.clone(),
            inner.on_lane,
        )
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Reads the value of this resource by running its get handler in-process.
    ///
    /// Returns `None` if the handler produced no value. An error reply of the
    /// handler is returned as the error.
    pub async fn value<T: DeserializeOwned>(&self) -> Result<Option<T>, ResError> {
        let Some(get) = self.inner.entry.get.clone() else {
            return Err(ResError::not_found());
        };

        let core = RequestCore::for_value(self.inner.query.clone());
        let req = GetRequest::new(core.clone(), self.clone());
        trace!(rid = %self.inner.name, "Reading resource value");
        run_handler(&core, &self.inner.name, get.call(req)).await;

        match core.take_value() {
            None | Some(Ok(Value::Null)) => Ok(None),
            Some(Ok(value)) => serde_json::from_value(value)
                .map(Some)
                .map_err(ResError::internal_from),
            Some(Err(err)) => Err(err),
        }
    }

    /// Like [`value`](Self::value), but a missing value is an internal error.
    pub async fn require_value<T: DeserializeOwned>(&self) -> Result<T, ResError> {
        self.value()
            .await?
            .ok_or_else(|| ResError::internal_from(format!("no value for '{}'", self.inner.name)))
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Emits a change event and returns the revert map.
    ///
    /// Returns `None` when no apply function is registered. Nothing is
    /// published if `changes` is empty or if the apply function reports no
    /// effective change. Otherwise only the properties present in the revert
    /// map are published.
    pub async fn change_event(&self, mut changes: Map<String, Value>) -> EventResult<Option<Map<String, Value>>> {
        self.expect_lane()?;
        self.expect_type("change", ResourceType::Model)?;
        if changes.is_empty() {
            return Ok(None);
        }

        let revert = match &self.inner.entry.apply.change {
            Some(apply) => {
                let revert = apply(self, &changes)?;
                if revert.is_empty() {
                    trace!(rid = %self.inner.name, "Change had no effect, not published");
                    return Ok(Some(revert));
                }
                changes.retain(|key, _| revert.contains_key(key));
                Some(revert)
            }
            None => None,
        };

        self.publish(ResourceEvent::Change { values: changes }).await?;
        Ok(revert)
    }

    /// Emits an add event inserting `value` at `idx`.
    pub async fn add_event<T: Serialize + ?Sized>(&self, value: &T, idx: usize) -> EventResult<()> {
        self.expect_lane()?;
        self.expect_type("add", ResourceType::Collection)?;
        let value = to_event_value(value)?;
        if let Some(apply) = &self.inner.entry.apply.add {
            apply(self, &value, idx)?;
        }
        self.publish(ResourceEvent::Add { value, idx }).await
    }

    /// Emits a remove event and returns the removed value, if an apply
    /// function is registered.
    pub async fn remove_event(&self, idx: usize) -> EventResult<Option<Value>> {
        self.expect_lane()?;
        self.expect_type("remove", ResourceType::Collection)?;
        let removed = match &self.inner.entry.apply.remove {
            Some(apply) => Some(apply(self, idx)?),
            None => None,
        };
        self.publish(ResourceEvent::Remove { idx }).await?;
        Ok(removed)
    }

    /// Emits a create event.
    pub async fn create_event<T: Serialize + ?Sized>(&self, data: &T) -> EventResult<()> {
        self.expect_lane()?;
        let data = to_event_value(data)?;
        if let Some(apply) = &self.inner.entry.apply.create {
            apply(self, &data)?;
        }
        self.publish(ResourceEvent::Create { data }).await
    }

    /// Emits a delete event and returns the deleted data, if an apply
    /// function is registered.
    pub async fn delete_event(&self) -> EventResult<Option<Value>> {
        self.expect_lane()?;
        let deleted = match &self.inner.entry.apply.delete {
            Some(apply) => Some(apply(self)?),
            None => None,
        };
        self.publish(ResourceEvent::Delete).await?;
        Ok(deleted)
    }

    /// Emits a custom event.
    pub async fn event<T: Serialize + ?Sized>(&self, name: &str, payload: &T) -> EventResult<()> {
        self.expect_lane()?;
        validate_event_name(name).map_err(EventError::InvalidName)?;
        let payload = to_event_value(payload)?;
        if let Some(apply) = &self.inner.entry.apply.custom {
            apply(self, name, &payload)?;
        }
        self.publish(ResourceEvent::Custom {
            name: name.to_string(),
            payload,
        })
        .await
    }

    /// Tells the gateway to re-evaluate access to this resource.
    pub async fn reaccess_event(&self) -> EventResult<()> {
        self.expect_lane()?;
        self.publish(ResourceEvent::Reaccess).await
    }

    fn expect_lane(&self) -> EventResult<()> {
        if !self.inner.on_lane {
            return Err(EventError::Detached(self.inner.name.clone()));
        }
        Ok(())
    }

    fn expect_type(&self, event: &'static str, expected: ResourceType) -> EventResult<()> {
        let declared = self.inner.entry.resource_type;
        if declared != ResourceType::Unknown && declared != expected {
            return Err(EventError::TypeMismatch {
                event,
                rid: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    async fn publish(&self, event: ResourceEvent) -> EventResult<()> {
        let subject = event.subject(&self.inner.name);
        let payload = event.payload().map_err(|e| EventError::Encode(e.to_string()))?;
        debug!(rid = %self.inner.name, event = event.name(), "Publishing event");
        self.inner.service.publish(&subject, payload).await?;
        Ok(())
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("rid", &self.inner.name)
            .field("params", &self.inner.params)
            .field("query", &self.inner.query)
            .field("group", &self.inner.group)
            .finish()
    }
}

fn to_event_value<T: Serialize + ?Sized>(value: &T) -> EventResult<Value> {
    serde_json::to_value(value).map_err(|e| EventError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{CachedValue, ValueCache};
    use crate::handler::{Handler, HandlerResult};
    use crate::testing::MockConnection;
    use resmesh_core::{CODE_INTERNAL_ERROR, delete_action};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Book {
        title: String,
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    async fn get_book(req: GetRequest) -> HandlerResult {
        match req.path_param("id") {
            Some("1") => req.model(&json!({"title": "Dune"})).await,
            Some("2") => {}
            _ => req.not_found().await,
        }
        Ok(())
    }

    async fn get_filtered(req: GetRequest) -> HandlerResult {
        match req.query() {
            Some(query) => req.query_collection(&json!([query]), query).await,
            None => req.collection(&json!([])).await,
        }
        Ok(())
    }

    fn service(conn: &Arc<MockConnection>, cache: &ValueCache) -> Service {
        let service = Service::builder("library")
            .handle("book.$id", Handler::new().get_model(get_book))
            .unwrap()
            .handle("shelf.$id", Handler::new().with_cache(cache.clone()))
            .unwrap()
            .handle("search", Handler::new().get_collection(get_filtered))
            .unwrap()
            .build()
            .unwrap();
        service.attach(conn.clone());
        service
    }

    fn on_lane(service: &Service, rid: &str) -> Resource {
        service.resolve_resource(rid, true).unwrap()
    }

    #[tokio::test]
    async fn test_value_runs_get_handler_in_process() {
        let conn = MockConnection::new();
        let service = service(&conn, &ValueCache::new());

        let book: Option<Book> = service.resource("library.book.1").unwrap().value().await.unwrap();
        assert_eq!(book, Some(Book { title: "Dune".into() }));

        let none: Option<Book> = service.resource("library.book.2").unwrap().value().await.unwrap();
        assert_eq!(none, None);

        let err = service
            .resource("library.book.3")
            .unwrap()
            .value::<Book>()
            .await
            .unwrap_err();
        assert_eq!(err, ResError::not_found());
        assert!(conn.published().is_empty());
    }

    #[tokio::test]
    async fn test_require_value_rejects_missing_value() {
        let conn = MockConnection::new();
        let service = service(&conn, &ValueCache::new());

        let err = service
            .resource("library.book.2")
            .unwrap()
            .require_value::<Book>()
            .await
            .unwrap_err();
        assert_eq!(err.code, CODE_INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_with_query_reads_query_variant() {
        let conn = MockConnection::new();
        let service = service(&conn, &ValueCache::new());
        let search = service.resource("library.search").unwrap();

        let all: Vec<String> = search.require_value().await.unwrap();
        assert!(all.is_empty());

        let filtered: Vec<String> = search.with_query("q=dune").require_value().await.unwrap();
        assert_eq!(filtered, vec!["q=dune".to_string()]);
    }

    #[tokio::test]
    async fn test_change_event_applies_before_publishing() {
        let conn = MockConnection::new();
        let cache = ValueCache::new();
        cache.insert("library.shelf.1", CachedValue::Model(map(json!({"name": "Sci-fi"}))));
        let service = service(&conn, &cache);
        let shelf = on_lane(&service, "library.shelf.1");

        let revert = shelf
            .change_event(map(json!({"name": "Fantasy", "floor": 2})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revert, map(json!({"name": "Sci-fi", "floor": delete_action()})));
        assert_eq!(
            cache.get("library.shelf.1"),
            Some(CachedValue::Model(map(json!({"name": "Fantasy", "floor": 2}))))
        );
        assert_eq!(
            conn.published_on("event.library.shelf.1.change"),
            vec![serde_json::to_vec(&json!({"values": {"floor": 2, "name": "Fantasy"}})).unwrap()]
        );

        // Same values again: nothing to publish.
        shelf
            .change_event(map(json!({"name": "Fantasy"})))
            .await
            .unwrap();
        assert_eq!(conn.published_on("event.library.shelf.1.change").len(), 1);
    }

    #[tokio::test]
    async fn test_collection_events_use_cache() {
        let conn = MockConnection::new();
        let cache = ValueCache::new();
        let service = service(&conn, &cache);
        let shelf = on_lane(&service, "library.shelf.2");

        shelf.create_event(&json!(["a", "b", "c"])).await.unwrap();
        shelf.add_event("x", 2).await.unwrap();
        assert_eq!(
            cache.get("library.shelf.2"),
            Some(CachedValue::Collection(vec![json!("a"), json!("b"), json!("x"), json!("c")]))
        );

        let removed = shelf.remove_event(2).await.unwrap();
        assert_eq!(removed, Some(json!("x")));

        let err = shelf.add_event("y", 9).await.unwrap_err();
        assert!(matches!(err, EventError::OutOfRange { idx: 9, len: 3 }));
        assert!(conn.published_on("event.library.shelf.2.add").len() == 1);

        let deleted = shelf.delete_event().await.unwrap();
        assert_eq!(deleted, Some(json!(["a", "b", "c"])));
        assert!(matches!(
            shelf.delete_event().await,
            Err(EventError::NotCreated(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_event_names_are_validated() {
        let conn = MockConnection::new();
        let service = service(&conn, &ValueCache::new());
        let book = on_lane(&service, "library.book.1");

        book.event("borrowed", &json!({"by": "ann"})).await.unwrap();
        assert!(matches!(
            book.event("change", &json!({})).await,
            Err(EventError::InvalidName(_))
        ));
        assert!(matches!(
            book.add_event(&json!(1), 0).await,
            Err(EventError::TypeMismatch { event: "add", .. })
        ));
        book.reaccess_event().await.unwrap();

        assert_eq!(
            conn.published_on("event.library.book.1.borrowed"),
            vec![br#"{"by":"ann"}"#.to_vec()]
        );
        assert_eq!(conn.published_on("event.library.book.1.reaccess"), vec![Vec::<u8>::new()]);
    }

    #[tokio::test]
    async fn test_change_event_publishes_only_effective_changes() {
        let conn = MockConnection::new();
        let cache = ValueCache::new();
        cache.insert("library.shelf.3", CachedValue::Model(map(json!({"name": "Fantasy"}))));
        let service = service(&conn, &cache);
        let shelf = on_lane(&service, "library.shelf.3");

        let revert = shelf
            .change_event(map(json!({"name": "Fantasy", "floor": 2, "ghost": delete_action()})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revert, map(json!({"floor": delete_action()})));
        assert_eq!(
            conn.published_on("event.library.shelf.3.change"),
            vec![serde_json::to_vec(&json!({"values": {"floor": 2}})).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_detached_resource_cannot_emit_events() {
        let conn = MockConnection::new();
        let cache = ValueCache::new();
        cache.insert("library.shelf.4", CachedValue::Model(map(json!({"name": "Poetry"}))));
        let service = service(&conn, &cache);
        let shelf = service.resource("library.shelf.4").unwrap();
        assert!(!shelf.is_on_lane());

        assert!(matches!(
            shelf.change_event(map(json!({"name": "Drama"}))).await,
            Err(EventError::Detached(rid)) if rid == "library.shelf.4"
        ));
        assert!(matches!(shelf.delete_event().await, Err(EventError::Detached(_))));
        assert!(matches!(
            shelf.with_query("q=x").reaccess_event().await,
            Err(EventError::Detached(_))
        ));
        assert_eq!(
            cache.get("library.shelf.4"),
            Some(CachedValue::Model(map(json!({"name": "Poetry"}))))
        );
        assert!(conn.published().is_empty());

        let value: Value = shelf.require_value().await.unwrap();
        assert_eq!(value, json!({"name": "Poetry"}));
    }
}
