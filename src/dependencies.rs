//! Workflow dependencies: fetching their server code and splicing it into
//! the workflow script.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use futures_util::future::try_join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Source file type holding an integration's server code.
pub const SERVER_CODE_FILE_TYPE: &str = "Integration.Server.Code";

/// Marker in dependency code replaced by the dependency's `process` object.
pub const INJECT_MARKER: &str = "/* @__PINFLOW_INJECT__ */";

/// A workflow dependency as described by the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDependency {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub env: BTreeMap<String, Value>,
    #[serde(default)]
    pub integration_version_id: Option<String>,
    #[serde(default)]
    pub integration_connection: Option<IntegrationConnection>,
    #[serde(default)]
    pub source_files: Vec<SourceFile>,
    /// Server code, present once fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConnection {
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    #[serde(rename = "type")]
    pub file_type: String,
    pub source: String,
}

impl WorkflowDependency {
    /// URL of the server-code source file, if the dependency has one.
    pub fn find_source(&self) -> Option<&str> {
        self.source_files
            .iter()
            .find(|file| file.file_type == SERVER_CODE_FILE_TYPE)
            .map(|file| file.source.as_str())
    }
}

/// Read a JSON manifest: an array of dependencies.
pub fn load_manifest(path: &Path) -> Result<Vec<WorkflowDependency>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read dependency manifest '{}': {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Invalid dependency manifest '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Fetches dependency server code.
#[derive(Debug, Clone)]
pub struct DependencyFetcher {
    client: Client,
    token: Option<String>,
}

const FETCH_TIMEOUT_SECS: u64 = 30;
const FETCH_CONNECT_TIMEOUT_SECS: u64 = 10;

impl DependencyFetcher {
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(FETCH_CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, token })
    }

    /// Fetch every dependency's code concurrently.
    ///
    /// The first failure aborts the whole operation; nothing is retried.
    pub async fn fetch_all(
        &self,
        dependencies: Vec<WorkflowDependency>,
    ) -> Result<Vec<WorkflowDependency>> {
        info!("Fetching {} workflow dependency(ies)", dependencies.len());
        try_join_all(
            dependencies
                .into_iter()
                .map(|dependency| self.fetch_one(dependency)),
        )
        .await
    }

    pub async fn fetch_one(&self, mut dependency: WorkflowDependency) -> Result<WorkflowDependency> {
        let source = dependency.find_source().ok_or_else(|| {
            Error::Config(format!(
                "Workflow dependency '{}' does not have a source file.",
                dependency.slug
            ))
        })?;

        debug!("Fetching '{}' from {}", dependency.slug, source);
        let mut request = self
            .client
            .get(source)
            .header("x-pinflow-source", "cli");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let fetch_error = |message: String| Error::Fetch {
            dependency: dependency.slug.clone(),
            message,
        };

        let response = request
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !status.is_success() {
            return Err(fetch_error(format!(
                "Status: {}. Response: '{}'",
                status.as_u16(),
                text
            )));
        }

        dependency.code = Some(text);
        Ok(dependency)
    }
}

/// Render a JSON value as a Rhai literal.
pub fn rhai_literal(value: &Value) -> String {
    match value {
        Value::Null => "()".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => float_literal(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => string_literal(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(rhai_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(key, value)| format!("{}: {}", string_literal(key), rhai_literal(value)))
                .collect();
            format!("#{{{}}}", entries.join(", "))
        }
    }
}

fn float_literal(f: f64) -> String {
    let text = format!("{:?}", f);
    if text.contains('.') {
        return text;
    }
    match text.split_once('e') {
        Some((mantissa, exponent)) => format!("{}.0e{}", mantissa, exponent),
        None => format!("{}.0", text),
    }
}

fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// The statement declaring one dependency's `process` object.
fn process_statement(dependency: &WorkflowDependency) -> String {
    let env = Value::Object(dependency.env.clone().into_iter().collect());
    let access_token = dependency
        .integration_connection
        .as_ref()
        .and_then(|connection| connection.access_token.clone())
        .map_or(Value::Null, Value::String);

    format!(
        "let process = PROCESS; process.env += {}; process.auth = #{{ accessToken: {} }};",
        rhai_literal(&env),
        rhai_literal(&access_token)
    )
}

/// Rewrite each dependency's code with its own `process` object and join
/// the results in input order.
pub fn assemble_injection(dependencies: &[WorkflowDependency]) -> Result<String> {
    let mut bodies = Vec::with_capacity(dependencies.len());

    for dependency in dependencies {
        let code = dependency
            .code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "Workflow dependency '{}' has no code.",
                    dependency.slug
                ))
            })?;

        if !code.contains(INJECT_MARKER) {
            return Err(Error::Config(format!(
                "Workflow dependency '{}' is missing the {} marker.",
                dependency.slug, INJECT_MARKER
            )));
        }

        bodies.push(code.replace(INJECT_MARKER, &process_statement(dependency)));
    }

    Ok(bodies.join("\n"))
}
