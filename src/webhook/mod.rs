//! Worker-wide webhook routing.
//!
//! Every workflow node that needs an inbound HTTP endpoint registers it
//! through a [`Namespace`] obtained from the shared [`WebhookRouter`]. Routes
//! are keyed by `"METHOD:/path"`; a path may carry several handlers, which
//! all run for each request.

mod server;

pub use server::{create_router, WebhookServer};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info};

/// An inbound request as seen by webhook handlers.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebhookRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// A route handler. Returning `None` leaves the response to other handlers.
pub type WebhookHandler =
    Arc<dyn Fn(WebhookRequest) -> BoxFuture<'static, Option<Response>> + Send + Sync>;

/// Wrap an async closure as a [`WebhookHandler`].
pub fn handler<F, Fut>(f: F) -> WebhookHandler
where
    F: Fn(WebhookRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Join path segments into one absolute path with single slashes and no
/// trailing slash.
pub fn normalize_path(parts: &[&str]) -> String {
    let segments: Vec<&str> = parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect();
    format!("/{}", segments.join("/"))
}

fn route_key(method: &Method, path: &str) -> String {
    format!("{}:{}", method.as_str(), path)
}

/// Shared route table plus the absolute base URL namespaces resolve against.
#[derive(Clone)]
pub struct WebhookRouter {
    routes: Arc<RwLock<HashMap<String, Vec<WebhookHandler>>>>,
    base_url: Arc<str>,
}

impl WebhookRouter {
    pub fn new(base_url: impl AsRef<str>) -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            base_url: Arc::from(base_url.as_ref().trim_end_matches('/')),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a handle that registers routes under `base_path`.
    pub fn create_namespace(&self, base_path: &str) -> Namespace {
        let base_path = normalize_path(&[base_path]);
        let base_url = format!("{}{}", self.base_url, base_path);
        debug!("Created webhook namespace {}", base_url);
        Namespace {
            router: self.clone(),
            base_path,
            base_url,
        }
    }

    /// Append a handler for `method` on the absolute `path`.
    pub fn register(&self, method: Method, path: &str, handler: WebhookHandler) {
        let key = route_key(&method, &normalize_path(&[path]));
        info!("Registered webhook {}", key);
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        routes.entry(key).or_default().push(handler);
    }

    fn handlers_for(&self, method: &Method, path: &str) -> Vec<WebhookHandler> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes
            .get(&route_key(method, path))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct `METHOD:/path` keys.
    pub fn route_count(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Route one request.
    ///
    /// All handlers registered for the exact method and path run
    /// concurrently and are all awaited. The response comes from the first
    /// handler to settle with one; with none, the reply is 200 "OK". An
    /// unknown route is 404 "Not found".
    pub async fn dispatch(&self, request: WebhookRequest) -> Response {
        let handlers = self.handlers_for(&request.method, request.uri.path());
        if handlers.is_empty() {
            debug!("No webhook for {} {}", request.method, request.uri.path());
            return (StatusCode::NOT_FOUND, "Not found").into_response();
        }

        let mut pending: FuturesUnordered<_> = handlers
            .iter()
            .map(|handler| handler(request.clone()))
            .collect();

        let mut response = None;
        while let Some(result) = pending.next().await {
            if response.is_none() {
                response = result;
            }
        }

        response.unwrap_or_else(|| (StatusCode::OK, "OK").into_response())
    }
}

/// Route registration handle scoped to one base path.
#[derive(Clone)]
pub struct Namespace {
    router: WebhookRouter,
    base_path: String,
    base_url: String,
}

impl Namespace {
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Absolute URL of the namespace root.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `path` inside this namespace.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.router.base_url(),
            normalize_path(&[&self.base_path, path])
        )
    }

    pub fn route(&self, method: Method, path: &str, handler: WebhookHandler) {
        self.router
            .register(method, &normalize_path(&[&self.base_path, path]), handler);
    }

    pub fn get(&self, path: &str, handler: WebhookHandler) {
        self.route(Method::GET, path, handler);
    }

    pub fn head(&self, path: &str, handler: WebhookHandler) {
        self.route(Method::HEAD, path, handler);
    }

    pub fn post(&self, path: &str, handler: WebhookHandler) {
        self.route(Method::POST, path, handler);
    }

    pub fn put(&self, path: &str, handler: WebhookHandler) {
        self.route(Method::PUT, path, handler);
    }

    pub fn delete(&self, path: &str, handler: WebhookHandler) {
        self.route(Method::DELETE, path, handler);
    }
}

/// Build a plain-text response with the given status.
pub fn text_response(status: StatusCode, body: impl Into<String>) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(body.into()))
        .unwrap_or_else(|_| status.into_response())
}
