//! HTTP listener serving the webhook route table.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::{WebhookRequest, WebhookRouter};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::shutdown::CleanupRegistry;

/// Largest webhook request body accepted, in bytes.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Build the axum app: every path falls through to the route table.
pub fn create_router(webhooks: WebhookRouter) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(webhooks)
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

async fn handle_request(State(webhooks): State<WebhookRouter>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();

    if is_websocket_upgrade(&parts.headers) {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &webhooks).await {
            Ok(ws) => ws.on_upgrade(drain_socket).into_response(),
            Err(rejection) => rejection.into_response(),
        };
    }

    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let headers = parts.headers.clone();

    let body = match Bytes::from_request(Request::from_parts(parts, body), &webhooks).await {
        Ok(bytes) => bytes,
        Err(rejection) => {
            warn!("Failed to read webhook body: {}", rejection);
            return rejection.into_response();
        }
    };

    webhooks
        .dispatch(WebhookRequest {
            method,
            uri,
            headers,
            body,
        })
        .await
}

/// Accept a WebSocket connection and discard everything it sends.
async fn drain_socket(mut socket: WebSocket) {
    debug!("WebSocket client connected");
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }
    debug!("WebSocket client disconnected");
}

/// A bound listener, not yet serving.
pub struct WebhookServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WebhookServer {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL the listener answers on, using the bound port.
    pub fn listener_url(&self) -> String {
        format!("http://localhost:{}", self.local_addr.port())
    }

    /// Start serving in the background.
    ///
    /// Stopping the listener is registered into `cleanup`; it finishes once
    /// in-flight requests complete.
    pub fn serve(self, webhooks: WebhookRouter, cleanup: &CleanupRegistry) {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let app = create_router(webhooks);
        let addr = self.local_addr;

        let task = tokio::spawn(async move {
            info!("Webhook server listening on {}", addr);
            let result = axum::serve(self.listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Webhook server error: {}", e);
            }
        });

        cleanup.register(move || async move {
            let _ = stop_tx.send(());
            if let Err(e) = task.await {
                warn!("Webhook server task failed: {}", e);
            }
            info!("Webhook server stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use crate::webhook::{handler, text_response};
    use axum::body::Body;
    use axum::http::Method;
    use tower::ServiceExt;

    fn request(method: Method, uri: &str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_registered_route_is_served() {
        let webhooks = WebhookRouter::new("http://localhost:3333");
        webhooks.create_namespace("/hooks/abc").get(
            "/x",
            handler(|_| async { Some(text_response(StatusCode::OK, "hello")) }),
        );

        let app = create_router(webhooks);
        let response = app
            .oneshot(request(Method::GET, "/hooks/abc/x"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello");
    }

    #[tokio::test]
    async fn test_other_method_is_404() {
        let webhooks = WebhookRouter::new("http://localhost:3333");
        webhooks
            .create_namespace("/hooks/abc")
            .get("/x", handler(|_| async { None }));

        let app = create_router(webhooks);
        let response = app
            .oneshot(request(Method::DELETE, "/hooks/abc/x"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Not found");
    }

    #[tokio::test]
    async fn test_body_reaches_handler() {
        let webhooks = WebhookRouter::new("http://localhost:3333");
        webhooks.create_namespace("/hooks").post(
            "/echo",
            handler(|request: WebhookRequest| async move {
                Some(text_response(
                    StatusCode::OK,
                    String::from_utf8_lossy(&request.body).to_string(),
                ))
            }),
        );

        let app = create_router(webhooks);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/hooks/echo")
                    .body(Body::from("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(body_text(response).await, "ping");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let webhooks = WebhookRouter::new("http://localhost:3333");
        webhooks.create_namespace("/hooks").post(
            "/echo",
            handler(|_| async { Some(text_response(StatusCode::OK, "read")) }),
        );

        let app = create_router(webhooks);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/hooks/echo")
                    .body(Body::from(vec![b'x'; MAX_BODY_BYTES + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_server_stops_through_cleanup() {
        let config = ServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
        };
        let server = WebhookServer::bind(&config).await.unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let webhooks = WebhookRouter::new(server.listener_url());
        webhooks.create_namespace("/hooks").get(
            "/ping",
            handler(|_| async { Some(text_response(StatusCode::OK, "pong")) }),
        );

        let coordinator = ShutdownCoordinator::new();
        server.serve(webhooks, coordinator.cleanup());
        assert_eq!(coordinator.cleanup().len(), 1);

        let url = format!("http://{}/hooks/ping", addr);
        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(body, "pong");

        coordinator.request_shutdown(crate::shutdown::ShutdownReason::Terminate);
        assert_eq!(coordinator.run_cleanups().await, 0);

        assert!(reqwest::get(&url).await.is_err());
    }
}
