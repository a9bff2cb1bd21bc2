//! Action execution - the single place where step side effects happen
//!
//! The executor performs one action and returns a structured output map.
//! It never touches the execution context; exporting outputs into run
//! variables is the step runner's job. HTTP responses never fail on
//! non-2xx status codes, that judgement belongs to step validations.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Method;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;

use crate::core::EngineConfig;

use super::model::ActionKind;

/// Executes individual step actions
pub struct ActionExecutor {
    http: reqwest::Client,
    allow_unsafe_shell: bool,
    default_timeout: Duration,
}

impl ActionExecutor {
    /// Build an executor from engine configuration
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            allow_unsafe_shell: config.allow_unsafe_shell,
            default_timeout: Duration::from_secs(config.http_timeout_secs),
        }
    }

    /// Execute one action and return its outputs
    pub async fn execute(
        &self,
        action: ActionKind,
        args: &Map<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        match action {
            ActionKind::Noop => self.execute_noop(args).await,
            ActionKind::Wait => self.execute_wait(args).await,
            ActionKind::HttpRequest => self.execute_http_request(args).await,
            ActionKind::Shell => self.execute_shell(args).await,
        }
    }

    async fn execute_noop(&self, args: &Map<String, Value>) -> Result<HashMap<String, Value>> {
        let delay = number_arg(args, "delay").unwrap_or(0.0);
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("noop");
        let mut outputs = HashMap::new();
        outputs.insert("message".to_string(), Value::String(message.to_string()));
        Ok(outputs)
    }

    async fn execute_wait(&self, args: &Map<String, Value>) -> Result<HashMap<String, Value>> {
        let seconds = number_arg(args, "seconds").unwrap_or(1.0);
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
        let mut outputs = HashMap::new();
        outputs.insert(
            "slept".to_string(),
            args.get("seconds").cloned().unwrap_or(Value::from(1)),
        );
        Ok(outputs)
    }

    async fn execute_http_request(
        &self,
        args: &Map<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow!("http_request requires 'url'"))?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_str(&method)
            .map_err(|_| anyhow!("Unsupported HTTP method: {}", method))?;
        let timeout = number_arg(args, "timeout")
            .map(Duration::from_secs_f64)
            .unwrap_or(self.default_timeout);

        let mut request = self.http.request(method, url).timeout(timeout);

        if let Some(Value::Object(headers)) = args.get("headers") {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }
        if let Some(body) = args.get("json") {
            request = request.json(body);
        } else if let Some(Value::String(data)) = args.get("data") {
            request = request.body(data.clone());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("HTTP request to {} failed", url))?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "status_code".to_string(),
            Value::from(response.status().as_u16()),
        );
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        outputs.insert("headers".to_string(), Value::Object(headers));

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<Value>(&body) {
            Ok(parsed) => {
                outputs.insert("body_json".to_string(), parsed);
            }
            Err(_) => {
                outputs.insert("body".to_string(), Value::String(body));
            }
        }

        Ok(outputs)
    }

    async fn execute_shell(&self, args: &Map<String, Value>) -> Result<HashMap<String, Value>> {
        if !self.allow_unsafe_shell {
            bail!("Shell action is disabled. Enable with allow_unsafe_shell at engine construction.");
        }
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow!("shell requires 'command'"))?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn shell command: {}", command))?;

        let returncode = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        let mut outputs = HashMap::new();
        outputs.insert("returncode".to_string(), Value::from(returncode));
        outputs.insert("stdout".to_string(), Value::String(stdout));
        outputs.insert("stderr".to_string(), Value::String(stderr.clone()));

        if returncode != 0 {
            bail!("Non-zero return code: {}: {}", returncode, stderr);
        }

        Ok(outputs)
    }
}

/// Read a numeric argument that may arrive as number or string
fn number_arg(args: &Map<String, Value>, key: &str) -> Option<f64> {
    match args.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executor(allow_shell: bool) -> ActionExecutor {
        let config = EngineConfig {
            allow_unsafe_shell: allow_shell,
            ..EngineConfig::default()
        };
        ActionExecutor::new(&config)
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_noop_outputs_message() {
        let outputs = executor(false)
            .execute(ActionKind::Noop, &args(json!({"message": "done"})))
            .await
            .unwrap();
        assert_eq!(outputs["message"], json!("done"));
    }

    #[tokio::test]
    async fn test_wait_outputs_slept() {
        let start = std::time::Instant::now();
        let outputs = executor(false)
            .execute(ActionKind::Wait, &args(json!({"seconds": 0.05})))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(outputs["slept"], json!(0.05));
    }

    #[tokio::test]
    async fn test_shell_disabled_by_default() {
        let err = executor(false)
            .execute(ActionKind::Shell, &args(json!({"command": "echo hi"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_shell_captures_outputs() {
        let outputs = executor(true)
            .execute(ActionKind::Shell, &args(json!({"command": "echo hello"})))
            .await
            .unwrap();
        assert_eq!(outputs["returncode"], json!(0));
        assert_eq!(outputs["stdout"], json!("hello"));
    }

    #[tokio::test]
    async fn test_shell_nonzero_fails() {
        let err = executor(true)
            .execute(ActionKind::Shell, &args(json!({"command": "exit 3"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Non-zero return code: 3"));
    }

    #[tokio::test]
    async fn test_http_requires_url() {
        let err = executor(false)
            .execute(ActionKind::HttpRequest, &args(json!({"method": "GET"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}
