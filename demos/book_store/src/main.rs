//! Book Store Demo
//!
//! An in-memory book store served as resources on the in-process bus. A
//! client task plays the part of the gateway and walks through a few
//! requests once the service is up.
//!
//! # Resources
//!
//! ```text
//! bookstore.books        collection of book references
//!                        call "new" {title, author} -> resource reference
//! bookstore.book.$id     model {title, author}
//!                        call "set" {title?, author?}
//!                        call "delete"
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --package book-store
//! RESMESH_LOGGING__LEVEL=debug cargo run --package book-store
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use resmesh::core::{RequestEnvelope, ResponseFrame};
use resmesh::framework::{CachedValue, EventError, RegistrationError};
use resmesh::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

const SERVICE: &str = "bookstore";
const BOOKS: &str = "bookstore.books";

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Deserialize)]
struct NewBook {
    title: String,
    author: String,
}

#[derive(Debug, Default, Deserialize)]
struct BookChanges {
    title: Option<String>,
    author: Option<String>,
}

/// Cached books plus the next free ID.
struct Store {
    cache: ValueCache,
    next_id: AtomicU64,
}

impl Store {
    fn seeded() -> Self {
        let cache = ValueCache::new();
        let seed = [
            ("Animal Farm", "George Orwell"),
            ("Brave New World", "Aldous Huxley"),
            ("Coraline", "Neil Gaiman"),
        ];

        let mut refs = Vec::new();
        for (id, (title, author)) in seed.iter().enumerate() {
            let rid = book_rid(id as u64 + 1);
            let mut book = Map::new();
            book.insert("title".into(), json!(title));
            book.insert("author".into(), json!(author));
            cache.insert(rid.clone(), CachedValue::Model(book));
            refs.push(json!(Ref::new(rid)));
        }
        cache.insert(BOOKS, CachedValue::Collection(refs));

        Self {
            cache,
            next_id: AtomicU64::new(seed.len() as u64 + 1),
        }
    }

    /// Creates a book and appends a reference to it to the book list.
    async fn new_book(&self, req: CallRequest) -> HandlerResult {
        let book: NewBook = match req.parse_params() {
            Ok(book) => book,
            Err(e) => {
                req.error(e).await;
                return Ok(());
            }
        };
        if book.title.trim().is_empty() || book.author.trim().is_empty() {
            req.invalid_params("Title and author must not be empty").await;
            return Ok(());
        }

        let rid = book_rid(self.next_id.fetch_add(1, Ordering::SeqCst));
        let data = json!({"title": book.title.trim(), "author": book.author.trim()});
        let created = rid.clone();
        req.service()
            .with(&rid, move |book| async move {
                if let Err(e) = book.create_event(&data).await {
                    error!(rid = %created, error = %e, "Failed to create book");
                }
            })
            .await?;

        let len = match self.cache.get(BOOKS) {
            Some(CachedValue::Collection(items)) => items.len(),
            _ => 0,
        };
        req.add_event(&Ref::new(rid.as_str()), len).await?;
        info!(rid = %rid, "Book added");
        req.resource_ref(&rid).await;
        Ok(())
    }

    /// Removes a book and its reference in the book list.
    async fn delete_book(&self, req: CallRequest) -> HandlerResult {
        match req.delete_event().await {
            Ok(_) => {}
            Err(EventError::NotCreated(_)) => {
                req.not_found().await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let rid = req.resource_name().to_string();
        let cache = self.cache.clone();
        req.service()
            .with(BOOKS, move |books| async move {
                let idx = match cache.get(books.resource_name()) {
                    Some(CachedValue::Collection(items)) => items
                        .iter()
                        .position(|item| item.get("rid").and_then(Value::as_str) == Some(rid.as_str())),
                    _ => None,
                };
                if let Some(idx) = idx
                    && let Err(e) = books.remove_event(idx).await
                {
                    warn!(rid = %rid, error = %e, "Failed to remove book from list");
                }
            })
            .await?;

        req.ok_empty().await;
        Ok(())
    }
}

fn book_rid(id: u64) -> String {
    format!("{SERVICE}.book.{id}")
}

// ============================================================================
// Handler Functions
// ============================================================================

async fn allow_all(req: AccessRequest) -> HandlerResult {
    req.access_granted().await;
    Ok(())
}

async fn set_book(req: CallRequest) -> HandlerResult {
    let params: BookChanges = match req.parse_params() {
        Ok(params) => params,
        Err(e) => {
            req.error(e).await;
            return Ok(());
        }
    };

    let mut changes = Map::new();
    for (field, value) in [("title", params.title), ("author", params.author)] {
        let Some(value) = value else { continue };
        if value.trim().is_empty() {
            req.invalid_params(format!("{field} must not be empty")).await;
            return Ok(());
        }
        changes.insert(field.into(), json!(value.trim()));
    }

    match req.change_event(changes).await {
        Ok(_) => req.ok_empty().await,
        Err(EventError::NotCreated(_)) => req.not_found().await,
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn register(service: ServiceBuilder, store: &Arc<Store>) -> Result<ServiceBuilder, RegistrationError> {
    let on_new = {
        let store = store.clone();
        move |req: CallRequest| {
            let store = store.clone();
            async move { store.new_book(req).await }
        }
    };
    let on_delete = {
        let store = store.clone();
        move |req: CallRequest| {
            let store = store.clone();
            async move { store.delete_book(req).await }
        }
    };

    service
        .handle(
            "books",
            Handler::new()
                .with_cache(store.cache.clone())
                .access(allow_all)
                .new_call(on_new),
        )?
        .handle(
            "book.$id",
            Handler::new()
                .with_cache(store.cache.clone())
                .access(allow_all)
                .call("set", set_book)
                .call("delete", on_delete),
        )
}

// ============================================================================
// Gateway stand-in
// ============================================================================

async fn send(bus: &LocalBus, subject: &str, params: Option<Value>) -> Result<ResponseFrame> {
    let envelope = RequestEnvelope {
        params,
        ..Default::default()
    };
    let reply = bus
        .request(subject, envelope.encode()?, Duration::from_secs(3))
        .await?;
    Ok(ResponseFrame::decode(&reply)?)
}

async fn browse(bus: LocalBus) -> Result<()> {
    let books = send(&bus, &format!("get.{BOOKS}"), None).await?;
    info!(reply = ?books, "Listed books");

    let created = send(
        &bus,
        &format!("call.{BOOKS}.new"),
        Some(json!({"title": "Dune", "author": "Frank Herbert"})),
    )
    .await?;
    let ResponseFrame::Resource(rid) = created else {
        warn!(reply = ?created, "Unexpected reply to new");
        return Ok(());
    };

    let renamed = send(
        &bus,
        &format!("call.{rid}.set"),
        Some(json!({"title": "Dune Messiah"})),
    )
    .await?;
    info!(rid = %rid, reply = ?renamed, "Renamed book");

    let book = send(&bus, &format!("get.{rid}"), None).await?;
    info!(rid = %rid, reply = ?book, "Fetched book");

    let deleted = send(&bus, &format!("call.{}.delete", book_rid(1)), None).await?;
    info!(reply = ?deleted, "Deleted first book");

    let books = send(&bus, &format!("get.{BOOKS}"), None).await?;
    info!(reply = ?books, "Listed books");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut defaults = ResmeshConfig::default();
    defaults.service.name = SERVICE.to_string();

    let store = Arc::new(Store::seeded());
    let runtime = ServiceRuntime::builder()
        .merge(defaults)
        .build(|service| register(service, &store))?;

    let bus = runtime.local_bus();
    let client = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Err(e) = browse(client).await {
            error!(error = %e, "Client walkthrough failed");
        }
    });

    runtime.run(Arc::new(bus)).await?;
    Ok(())
}
