//! Building the single script the worker evaluates.

use crate::config::EXTERNAL_URL_VARS;
use crate::dependencies::rhai_literal;
use crate::error::{Error, Result};

/// Marker in workflow code replaced by the assembled dependency code.
pub const WORKFLOW_MARKER: &str = "/*<PINFLOW_WORKFLOW_DEPENDENCIES>*/";

const SCRIPT_HEADER: &str = "// pinflow worker script";

/// Assemble the worker script: header, optional external URL override, then
/// the workflow code with every marker replaced by `injection`.
pub fn build_script(
    workflow_code: &str,
    injection: &str,
    external_url: Option<&str>,
) -> Result<String> {
    if workflow_code.trim().is_empty() {
        return Err(Error::Config(
            "Workflow does not have any code associated with it.".to_string(),
        ));
    }
    if !workflow_code.contains(WORKFLOW_MARKER) {
        return Err(Error::Config(format!(
            "Workflow code is missing the {} marker.",
            WORKFLOW_MARKER
        )));
    }

    let override_line = external_url
        .map(|url| {
            format!(
                "PROCESS.env.{} = {};",
                EXTERNAL_URL_VARS[0],
                rhai_literal(&serde_json::Value::String(url.to_string()))
            )
        })
        .unwrap_or_default();

    Ok([
        SCRIPT_HEADER.to_string(),
        override_line,
        workflow_code.replace(WORKFLOW_MARKER, injection),
    ]
    .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_is_replaced() {
        let script = build_script(
            "let a = 1;\n/*<PINFLOW_WORKFLOW_DEPENDENCIES>*/\nlet b = 2;",
            "print(\"deps\");",
            None,
        )
        .unwrap();

        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], SCRIPT_HEADER);
        assert_eq!(lines[1], "");
        assert_eq!(&lines[2..], ["let a = 1;", "print(\"deps\");", "let b = 2;"]);
    }

    #[test]
    fn test_external_url_override() {
        let script = build_script(WORKFLOW_MARKER, "", Some("https://hooks.example.com"))
            .unwrap();
        assert!(script
            .contains(r#"PROCESS.env.PINFLOW_EXTERNAL_URL = "https://hooks.example.com";"#));
    }

    #[test]
    fn test_missing_marker_is_config_error() {
        let result = build_script("print(1);", "", None);
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("marker")));
    }

    #[test]
    fn test_empty_workflow_is_config_error() {
        assert!(matches!(build_script("  \n", "", None), Err(Error::Config(_))));
    }
}
