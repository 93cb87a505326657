//! Rhai host for the worker script.
//!
//! The script sees a mutable `PROCESS` map holding the ambient environment
//! and these host functions:
//!
//! - `webhook(base_path, method, path, body)` registers a route answering
//!   `200 body` and returns its absolute URL.
//! - `webhook(base_path, method, path, callback)` registers a route that
//!   calls `callback(request)` for every request and returns its absolute URL.
//!   `request` is a map with `method`, `path`, `query`, `headers`, `body` and
//!   `json`. The callback answers with a string (`200` text), a map holding
//!   `status` and `body`, any other value (`200` JSON) or `()` to leave the
//!   response to other handlers.
//! - `template(pin_type, text, data)` compiles `text` through the shared
//!   template cache and evaluates it against `data`.
//! - `run_node(node_id, execution, inputs, callback)` calls `callback(inputs)`
//!   under execution telemetry. `execution` is `()` for untriggered runs or a
//!   map with `executionId`, `triggerExecutionId` and `triggerNodeId`.
//!
//! A started script stays loaded on its blocking thread, which runs webhook
//! callbacks one at a time until the script is stopped.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Map, NativeCallContext, Scope, AST};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::telemetry::{noop_next, ExecutionContext, ExecutionTelemetry, NodeRunContext};
use crate::error::{Error, Result};
use crate::template::{PinType, TemplateCompiler};
use crate::webhook::{handler, text_response, WebhookRequest, WebhookRouter};

/// Operation budget for one script evaluation or callback.
pub const DEFAULT_MAX_OPERATIONS: u64 = 5_000_000;

type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// A request waiting for a script webhook callback.
struct WebhookCall {
    callback: usize,
    request: WebhookRequest,
    reply: oneshot::Sender<Option<Response>>,
}

/// Webhook callbacks registered by the script. Lives on the script thread.
#[derive(Clone)]
struct Callbacks {
    registered: Rc<RefCell<Vec<FnPtr>>>,
    calls: mpsc::WeakUnboundedSender<WebhookCall>,
}

impl Callbacks {
    fn new(calls: mpsc::WeakUnboundedSender<WebhookCall>) -> Self {
        Self {
            registered: Rc::default(),
            calls,
        }
    }

    fn register(&self, callback: FnPtr) -> usize {
        let mut registered = self.registered.borrow_mut();
        registered.push(callback);
        registered.len() - 1
    }

    fn get(&self, index: usize) -> Option<FnPtr> {
        self.registered.borrow().get(index).cloned()
    }
}

/// Services the script can reach.
#[derive(Clone)]
pub struct ScriptHost {
    webhooks: WebhookRouter,
    templates: Arc<TemplateCompiler>,
    telemetry: ExecutionTelemetry,
    env: BTreeMap<String, String>,
    max_operations: u64,
}

impl ScriptHost {
    pub fn new(
        webhooks: WebhookRouter,
        templates: Arc<TemplateCompiler>,
        telemetry: ExecutionTelemetry,
    ) -> Self {
        Self {
            webhooks,
            templates,
            telemetry,
            env: std::env::vars().collect(),
            max_operations: DEFAULT_MAX_OPERATIONS,
        }
    }

    /// Replace the ambient environment exposed as `PROCESS.env`.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_max_operations(mut self, max_operations: u64) -> Self {
        self.max_operations = max_operations;
        self
    }

    fn engine(&self, callbacks: &Callbacks) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        engine.on_print(|text| info!(target: "pinflow::script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(target: "pinflow::script", "{} ({:?} @ {})", text, source, pos)
        });

        let webhooks = self.webhooks.clone();
        engine.register_fn(
            "webhook",
            move |base_path: &str, method: &str, path: &str, body: &str| -> RhaiResult<String> {
                register_static_webhook(&webhooks, base_path, method, path, body)
            },
        );

        let webhooks = self.webhooks.clone();
        let registry = callbacks.clone();
        engine.register_fn(
            "webhook",
            move |base_path: &str,
                  method: &str,
                  path: &str,
                  callback: FnPtr|
                  -> RhaiResult<String> {
                register_script_webhook(&webhooks, &registry, base_path, method, path, callback)
            },
        );

        let templates = self.templates.clone();
        engine.register_fn(
            "template",
            move |pin_type: &str, text: &str, data: Dynamic| -> RhaiResult<Dynamic> {
                let compiled = templates
                    .compile(&PinType::from(pin_type), text)
                    .map_err(|e| e.to_string())?;
                let value = compiled
                    .evaluate(&dynamic_to_json(data))
                    .map_err(|e| e.to_string())?;
                Ok(json_to_dynamic(value))
            },
        );

        let telemetry = self.telemetry.clone();
        engine.register_fn(
            "run_node",
            move |ctx: NativeCallContext,
                  node_id: &str,
                  execution: Dynamic,
                  inputs: Dynamic,
                  callback: FnPtr|
                  -> RhaiResult<Dynamic> {
                run_tracked_node(&telemetry, &ctx, node_id, execution, inputs, callback)
            },
        );

        engine
    }

    fn scope(&self) -> Scope<'static> {
        let env: Map = self
            .env
            .iter()
            .map(|(key, value)| (key.as_str().into(), Dynamic::from(value.clone())))
            .collect();
        let mut process = Map::new();
        process.insert("env".into(), Dynamic::from(env));

        let mut scope = Scope::new();
        scope.push("PROCESS", process);
        scope
    }

    /// Compile and evaluate `script`, keeping what callbacks need afterwards.
    fn load(&self, script: &str, callbacks: &Callbacks) -> Result<(Engine, AST)> {
        let engine = self.engine(callbacks);
        let mut scope = self.scope();
        let ast = engine
            .compile_with_scope(&scope, script)
            .map_err(|e| Error::Script(e.to_string()))?;
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| Error::Script(e.to_string()))?;
        Ok((engine, ast))
    }

    /// Evaluate `script` on a blocking thread.
    ///
    /// Resolves once the top-level evaluation finishes. On success the script
    /// stays loaded and answers its webhook callbacks until
    /// [`ScriptTask::stop`].
    pub async fn start(&self, script: String) -> Result<ScriptTask> {
        let host = self.clone();
        let (calls, queue) = mpsc::unbounded_channel();
        let (loaded_tx, loaded_rx) = oneshot::channel();
        let callback_calls = calls.downgrade();

        let thread = tokio::task::spawn_blocking(move || {
            let callbacks = Callbacks::new(callback_calls);
            match host.load(&script, &callbacks) {
                Ok((engine, ast)) => {
                    let _ = loaded_tx.send(Ok(()));
                    serve_callbacks(&engine, &ast, &callbacks, queue);
                }
                Err(e) => {
                    let _ = loaded_tx.send(Err(e));
                }
            }
        });

        match loaded_rx.await {
            Ok(Ok(())) => Ok(ScriptTask { calls, thread }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let reason = match thread.await {
                    Err(e) => e.to_string(),
                    Ok(()) => "script thread exited".to_string(),
                };
                Err(Error::Script(format!("Script evaluation panicked: {}", reason)))
            }
        }
    }
}

/// A loaded script answering webhook callbacks on its own thread.
pub struct ScriptTask {
    calls: mpsc::UnboundedSender<WebhookCall>,
    thread: JoinHandle<()>,
}

impl ScriptTask {
    /// Answer the callbacks already queued, then unload the script.
    ///
    /// Requests arriving afterwards get no response from the script.
    pub async fn stop(self) {
        drop(self.calls);
        if let Err(e) = self.thread.await {
            warn!("Script thread failed: {}", e);
        }
        debug!("Script unloaded");
    }
}

fn serve_callbacks(
    engine: &Engine,
    ast: &AST,
    callbacks: &Callbacks,
    mut queue: mpsc::UnboundedReceiver<WebhookCall>,
) {
    while let Some(call) = queue.blocking_recv() {
        let path = call.request.uri.path().to_string();
        let response = callbacks
            .get(call.callback)
            .and_then(|callback| {
                let request = request_to_dynamic(&call.request);
                match callback.call::<Dynamic>(engine, ast, (request,)) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("Webhook callback for {} failed: {}", path, e);
                        None
                    }
                }
            })
            .and_then(|value| match script_response(value) {
                Ok(response) => response,
                Err(message) => {
                    warn!("Webhook callback for {} answered badly: {}", path, message);
                    None
                }
            });
        let _ = call.reply.send(response);
    }
}

fn parse_method(method: &str) -> RhaiResult<Method> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "HEAD" => Ok(Method::HEAD),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        other => Err(format!("Unsupported webhook method '{}'", other).into()),
    }
}

fn register_static_webhook(
    webhooks: &WebhookRouter,
    base_path: &str,
    method: &str,
    path: &str,
    body: &str,
) -> RhaiResult<String> {
    let method = parse_method(method)?;
    let namespace = webhooks.create_namespace(base_path);
    let body = body.to_string();
    namespace.route(
        method,
        path,
        handler(move |_| {
            let body = body.clone();
            async move { Some(text_response(StatusCode::OK, body)) }
        }),
    );
    Ok(namespace.url(path))
}

fn register_script_webhook(
    webhooks: &WebhookRouter,
    callbacks: &Callbacks,
    base_path: &str,
    method: &str,
    path: &str,
    callback: FnPtr,
) -> RhaiResult<String> {
    let method = parse_method(method)?;
    let index = callbacks.register(callback);
    let calls = callbacks.calls.clone();
    let namespace = webhooks.create_namespace(base_path);
    namespace.route(
        method,
        path,
        handler(move |request| {
            let calls = calls.upgrade();
            async move {
                let (reply, response) = oneshot::channel();
                calls?
                    .send(WebhookCall {
                        callback: index,
                        request,
                        reply,
                    })
                    .ok()?;
                response.await.ok().flatten()
            }
        }),
    );
    Ok(namespace.url(path))
}

fn request_to_dynamic(request: &WebhookRequest) -> Dynamic {
    let headers: Map = request
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().into(), Dynamic::from(value.to_string())))
        })
        .collect();
    let json = serde_json::from_slice::<Value>(&request.body)
        .map_or(Dynamic::UNIT, json_to_dynamic);

    let mut map = Map::new();
    map.insert("method".into(), Dynamic::from(request.method.to_string()));
    map.insert("path".into(), Dynamic::from(request.uri.path().to_string()));
    map.insert(
        "query".into(),
        Dynamic::from(request.uri.query().unwrap_or_default().to_string()),
    );
    map.insert("headers".into(), Dynamic::from(headers));
    map.insert(
        "body".into(),
        Dynamic::from(String::from_utf8_lossy(&request.body).into_owned()),
    );
    map.insert("json".into(), json);
    Dynamic::from(map)
}

/// Turn a callback's return value into the handler's response.
fn script_response(value: Dynamic) -> std::result::Result<Option<Response>, String> {
    if value.is_unit() {
        return Ok(None);
    }
    if value.is_string() {
        let body = value.into_string()?;
        return Ok(Some(text_response(StatusCode::OK, body)));
    }

    let Some(mut map) = value
        .clone()
        .try_cast::<Map>()
        .filter(|map| map.contains_key("status"))
    else {
        return Ok(Some(Json(dynamic_to_json(value)).into_response()));
    };

    let code = map
        .remove("status")
        .unwrap_or(Dynamic::UNIT)
        .as_int()
        .map_err(|found| format!("status must be an integer, found {}", found))?;
    let status = u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| format!("invalid status {}", code))?;

    let body = map.remove("body").unwrap_or(Dynamic::UNIT);
    let response = if body.is_unit() {
        status.into_response()
    } else if body.is_string() {
        text_response(status, body.into_string()?)
    } else {
        (status, Json(dynamic_to_json(body))).into_response()
    };
    Ok(Some(response))
}

/// Run a script callback as a node, reporting it through `telemetry`.
///
/// Must be called from a blocking thread inside a Tokio runtime.
fn run_tracked_node(
    telemetry: &ExecutionTelemetry,
    ctx: &NativeCallContext,
    node_id: &str,
    execution: Dynamic,
    inputs: Dynamic,
    callback: FnPtr,
) -> RhaiResult<Dynamic> {
    let execution = if execution.is_unit() {
        None
    } else {
        let parsed: ExecutionContext = serde_json::from_value(dynamic_to_json(execution))
            .map_err(|e| format!("Invalid execution context: {}", e))?;
        Some(parsed)
    };

    let mut node_ctx = NodeRunContext::new(dynamic_to_json(inputs), noop_next());
    if let Some(execution) = execution {
        node_ctx = node_ctx.with_execution(execution);
    }

    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| format!("run_node needs a Tokio runtime: {}", e))?;

    let mut result = Dynamic::UNIT;
    let slot = &mut result;
    let callback = &callback;
    runtime
        .block_on(telemetry.wrap(node_id, node_ctx, |run_ctx| async move {
            let outputs: Dynamic = callback
                .call_within_context(ctx, (json_to_dynamic(run_ctx.inputs.clone()),))
                .map_err(|e| Error::Node(e.to_string()))?;
            run_ctx.emit("out", dynamic_to_json(outputs.clone())).await?;
            *slot = outputs;
            Ok(())
        }))
        .map_err(|e| e.to_string())?;

    Ok(result)
}

/// Convert a Rhai value into JSON.
pub fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<rhai::INT>() {
        return Value::from(i);
    }
    if let Some(f) = value.clone().try_cast::<rhai::FLOAT>() {
        return serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number);
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if value.is_array() {
        return value
            .into_array()
            .map(|items| Value::Array(items.into_iter().map(dynamic_to_json).collect()))
            .unwrap_or(Value::Null);
    }
    match value.try_cast::<Map>() {
        Some(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key.to_string(), dynamic_to_json(value)))
                .collect(),
        ),
        None => Value::Null,
    }
}

/// Convert JSON into a Rhai value.
pub fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => n.as_f64().map_or(Dynamic::UNIT, Dynamic::from),
        },
        Value::String(s) => Dynamic::from(s),
        Value::Array(items) => {
            Dynamic::from(items.into_iter().map(json_to_dynamic).collect::<rhai::Array>())
        }
        Value::Object(map) => Dynamic::from(
            map.into_iter()
                .map(|(key, value)| (key.into(), json_to_dynamic(value)))
                .collect::<Map>(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::message::{ExecutionEvent, ExecutionStatus, Outbox, WorkerEvent};
    use serde_json::json;

    fn host_with_events() -> (ScriptHost, mpsc::UnboundedReceiver<WorkerEvent>) {
        let env = BTreeMap::from([("HOME_REGION".to_string(), "eu".to_string())]);
        let (outbox, rx) = Outbox::new();
        let host = ScriptHost::new(
            WebhookRouter::new("http://localhost:3333"),
            Arc::new(TemplateCompiler::new()),
            ExecutionTelemetry::new(outbox),
        )
        .with_env(env);
        (host, rx)
    }

    fn host() -> ScriptHost {
        host_with_events().0
    }

    /// Load `script`, then unload it.
    async fn evaluate(host: &ScriptHost, script: &str) -> Result<()> {
        host.start(script.to_string()).await?.stop().await;
        Ok(())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(WorkerEvent::LogExecution { data }) = rx.try_recv() {
            events.push(data);
        }
        events
    }

    fn request(method: Method, uri: &str) -> WebhookRequest {
        WebhookRequest::new(method, uri.parse().unwrap())
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_process_env_is_visible() {
        evaluate(
            &host(),
            r#"if PROCESS.env.HOME_REGION != "eu" { throw "wrong env"; }"#,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dependency_process_is_scoped_copy() {
        let script = r#"
            PROCESS.env.PINFLOW_EXTERNAL_URL = "https://ext";
            let process = PROCESS; process.env += #{"TOKEN": "a"}; process.auth = #{ accessToken: () };
            if process.env.TOKEN != "a" { throw "missing dependency env"; }
            if process.env.HOME_REGION != "eu" { throw "missing ambient env"; }
            if process.env.PINFLOW_EXTERNAL_URL != "https://ext" { throw "missing override"; }
            if type_of(process.auth.accessToken) != "()" { throw "unexpected token"; }
            if "TOKEN" in PROCESS.env { throw "ambient env was modified"; }
        "#;
        evaluate(&host(), script).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_function_registers_route() {
        let host = host();
        let webhooks = host.webhooks.clone();
        evaluate(
            &host,
            r#"
            let url = webhook("hooks/abc", "get", "/x", "hello");
            if url != "http://localhost:3333/hooks/abc/x" { throw url; }
            "#,
        )
        .await
        .unwrap();

        let response = webhooks.dispatch(request(Method::GET, "/hooks/abc/x")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello");
    }

    #[tokio::test]
    async fn test_webhook_rejects_unknown_method() {
        let err = evaluate(&host(), r#"webhook("/h", "TRACE", "/x", "");"#)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported webhook method"));
    }

    #[tokio::test]
    async fn test_webhook_callback_runs_node_per_request() {
        let (host, mut rx) = host_with_events();
        let webhooks = host.webhooks.clone();
        let task = host
            .start(
                r#"
                let url = webhook("/hooks/abc", "POST", "/run", |request| {
                    let execution = #{
                        executionId: "exec-1",
                        triggerExecutionId: "exec-0",
                        triggerNodeId: "trigger"
                    };
                    let out = run_node("echo", execution, #{body: request.body}, |inputs| inputs);
                    `got ${out.body}`
                });
                if url != "http://localhost:3333/hooks/abc/run" { throw url; }
                "#
                .to_string(),
            )
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        for body in ["ping", "pong"] {
            let response = webhooks
                .dispatch(request(Method::POST, "/hooks/abc/run").with_body(body))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, format!("got {}", body));

            let events = drain(&mut rx);
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].status, ExecutionStatus::Running);
            assert_eq!(events[0].node.inputs, Some(json!({"body": body})));
            assert_eq!(events[1].status, ExecutionStatus::Completed);
            assert_eq!(events[1].trigger.node.id, "trigger");
        }

        task.stop().await;
        let response = webhooks
            .dispatch(request(Method::POST, "/hooks/abc/run").with_body("late"))
            .await;
        assert_eq!(body_text(response).await, "OK");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_webhook_callback_answers() {
        let host = host();
        let webhooks = host.webhooks.clone();
        let task = host
            .start(
                r#"
                webhook("/h", "GET", "/status", |request| #{ status: 202, body: `queued ${request.query}` });
                webhook("/h", "POST", "/json", |request| #{ seen: request.json.n + 1 });
                webhook("/h", "GET", "/quiet", |request| ());
                webhook("/h", "GET", "/fails", |request| { throw "bad request"; });
                webhook("/h", "GET", "/bad-status", |request| #{ status: 7 });
                "#
                .to_string(),
            )
            .await
            .unwrap();

        let response = webhooks.dispatch(request(Method::GET, "/h/status?x=1")).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_text(response).await, "queued x=1");

        let response = webhooks
            .dispatch(request(Method::POST, "/h/json").with_body(r#"{"n": 1}"#))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(value, json!({"seen": 2}));

        for path in ["/h/quiet", "/h/fails", "/h/bad-status"] {
            let response = webhooks.dispatch(request(Method::GET, path)).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "OK");
        }

        task.stop().await;
    }

    #[tokio::test]
    async fn test_template_function() {
        let host = host();
        evaluate(
            &host,
            r#"
            let sum = template("number", "{{ a + b }}", #{a: 1, b: 2});
            if sum != 3 { throw `sum was ${sum}`; }
            let text = template("string", "Hi {{ name }}!", #{name: "Ada"});
            if text != "Hi Ada!" { throw text; }
            "#,
        )
        .await
        .unwrap();
        assert_eq!(host.templates.len(), 2);
    }

    #[tokio::test]
    async fn test_script_errors_are_reported() {
        let err = evaluate(&host(), "let x = ;").await.unwrap_err();
        assert_eq!(err.code(), "SCRIPT_ERROR");

        let err = evaluate(&host(), r#"throw "boom";"#).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_operation_limit() {
        let err = evaluate(&host().with_max_operations(1_000), "loop { }")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn test_json_conversion() {
        let value = json!({"a": [1, 2.5, "x", null, true], "b": {"c": "d"}});
        assert_eq!(dynamic_to_json(json_to_dynamic(value.clone())), value);
    }

    #[tokio::test]
    async fn test_run_node_with_execution_reports_lifecycle() {
        let (host, mut rx) = host_with_events();
        evaluate(
            &host,
            r#"
            let execution = #{
                executionId: "exec-1",
                triggerExecutionId: "exec-0",
                triggerNodeId: "trigger"
            };
            let out = run_node("double", execution, #{n: 21}, |inputs| #{n: inputs.n * 2});
            if out.n != 42 { throw "bad output"; }
            "#,
        )
        .await
        .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, ExecutionStatus::Running);
        assert_eq!(events[0].node.inputs, Some(json!({"n": 21})));
        assert_eq!(events[1].status, ExecutionStatus::Completed);
        assert_eq!(events[1].node.outputs, Some(json!({"n": 42})));
        assert_eq!(events[0].id, events[1].id);
        assert_eq!(events[1].trigger.node.id, "trigger");
    }

    #[tokio::test]
    async fn test_run_node_failure_is_contained() {
        let (host, mut rx) = host_with_events();
        evaluate(
            &host,
            r#"
            let execution = #{
                executionId: "exec-1",
                triggerExecutionId: "exec-0",
                triggerNodeId: "trigger"
            };
            run_node("broken", execution, #{}, |inputs| { throw "node exploded"; });
            "#,
        )
        .await
        .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, ExecutionStatus::Failed);
        let error = events[1].node.error.as_ref().unwrap();
        assert_eq!(error.code, "NODE_ERROR");
        assert!(error.message.contains("node exploded"));
    }

    #[tokio::test]
    async fn test_run_node_without_execution_passes_through() {
        let (host, mut rx) = host_with_events();
        evaluate(
            &host,
            r#"
            let out = run_node("plain", (), 1, |n| n + 1);
            if out != 2 { throw "bad output"; }
            "#,
        )
        .await
        .unwrap();
        assert!(drain(&mut rx).is_empty());

        let err = evaluate(&host, r#"run_node("plain", (), 1, |n| { throw "fails"; });"#)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fails"));
        assert!(drain(&mut rx).is_empty());
    }
}
