use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Instant, sleep};

use super::{CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaResult, CaptchaSolution, CaptchaTask};

const DEFAULT_ENDPOINT: &str = "https://api.capsolver.com";
const TURNSTILE_TASK_TYPE: &str = "AntiTurnstileTaskProxyLess";
/// Turnstile tokens are accepted for roughly five minutes.
const TOKEN_LIFETIME: Duration = Duration::from_secs(290);

/// Adapter for the CapSolver service (`createTask` + `getTaskResult`).
#[derive(Debug, Clone)]
pub struct CapSolverProvider {
    pub api_key: String,
    pub config: CaptchaConfig,
    endpoint: String,
    http: reqwest::Client,
}

impl CapSolverProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the provider at a different API host (self-hosted proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<ApiReply, CaptchaError> {
        let reply: ApiReply = self
            .http
            .post(format!("{}/{method}", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?
            .json()
            .await
            .map_err(|err| CaptchaError::Provider(err.to_string()))?;

        if reply.error_id != 0 {
            let description = reply
                .error_description
                .clone()
                .or_else(|| reply.error_code.clone())
                .unwrap_or_else(|| format!("errorId {}", reply.error_id));
            return Err(CaptchaError::Provider(description));
        }
        Ok(reply)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiReply {
    #[serde(default)]
    error_id: i64,
    error_code: Option<String>,
    error_description: Option<String>,
    task_id: Option<String>,
    status: Option<String>,
    solution: Option<ApiSolution>,
}

#[derive(Debug, Deserialize)]
struct ApiSolution {
    token: Option<String>,
}

#[async_trait]
impl CaptchaProvider for CapSolverProvider {
    fn name(&self) -> &'static str {
        "capsolver"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        if self.api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("missing CapSolver api key".into()));
        }

        let mut task_body = json!({
            "type": TURNSTILE_TASK_TYPE,
            "websiteURL": task.page_url.as_str(),
            "websiteKey": task.site_key,
        });
        if let Some(action) = &task.action {
            task_body["metadata"] = json!({ "action": action });
        }

        let created = self
            .call("createTask", json!({ "clientKey": self.api_key, "task": task_body }))
            .await?;
        if let Some(token) = created.solution.and_then(|solution| solution.token) {
            return Ok(CaptchaSolution::new(token).with_expiry(TOKEN_LIFETIME));
        }
        let task_id = created
            .task_id
            .ok_or_else(|| CaptchaError::Provider("createTask returned no taskId".into()))?;

        let deadline = Instant::now() + self.config.timeout;
        loop {
            sleep(self.config.poll_interval).await;
            let reply = self
                .call("getTaskResult", json!({ "clientKey": self.api_key, "taskId": task_id }))
                .await?;

            match reply.status.as_deref() {
                Some("ready") => {
                    let token = reply
                        .solution
                        .and_then(|solution| solution.token)
                        .ok_or_else(|| CaptchaError::Provider("ready result without token".into()))?;
                    return Ok(CaptchaSolution::new(token).with_expiry(TOKEN_LIFETIME));
                }
                Some("failed") => {
                    return Err(CaptchaError::Provider(format!("task {task_id} failed")));
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(CaptchaError::Timeout(self.config.timeout));
            }
        }
    }
}
