//! HTTP client for the out-of-process automation worker.
//!
//! The worker owns all page-level logic (browser, selectors). This side only
//! forwards the session cookies and maps responses back into outcomes.
//! Any response flagged `bot_protection`, or answered 403/429, is the
//! bot-protection signal.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use warclaw_core::traits::PageDriver;
use warclaw_core::{DriverOutcome, ExecutionContext, Result, TaskKind, WarClawError, World};

use crate::build_queue::{BuildSite, RemoteBuildState};
use crate::ledger::{ActionSender, PlannedAction, PlanningSource};

pub struct WorkerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl WorkerClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        ctx: &ExecutionContext,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.endpoint, path))
            .timeout(ctx.timeout)
            .header("Cookie", &ctx.credentials.cookie_header);
        if !ctx.credentials.user_agent.is_empty() {
            req = req.header("User-Agent", &ctx.credentials.user_agent);
        }
        req
    }

    async fn call(&self, req: reqwest::RequestBuilder, ctx: &ExecutionContext) -> Result<Value> {
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                WarClawError::Timeout(ctx.timeout.as_secs())
            } else {
                WarClawError::Http(format!("Worker request failed: {e}"))
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| WarClawError::Http(format!("Worker response: {e}")))?;
        classify_response(status, &body)
    }
}

/// Map a worker response to a JSON value or the matching error.
pub fn classify_response(status: u16, body: &str) -> Result<Value> {
    let json: Value = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).unwrap_or_else(|_| json!({ "error": body }))
    };
    let message = json["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status == 403 || status == 429 || json["bot_protection"].as_bool() == Some(true) {
        return Err(WarClawError::BotProtection(message));
    }
    if !(200..300).contains(&status) {
        return Err(WarClawError::Driver(format!("Worker returned {status}: {message}")));
    }
    Ok(json)
}

/// Generic per-kind driver: the worker runs the whole task.
pub struct WorkerDriver {
    client: Arc<WorkerClient>,
    kind: TaskKind,
    name: String,
}

impl WorkerDriver {
    pub fn new(client: Arc<WorkerClient>, kind: TaskKind) -> Self {
        Self {
            client,
            kind,
            name: format!("worker:{kind}"),
        }
    }

    async fn run(&self, world: &World, ctx: &ExecutionContext) -> Result<DriverOutcome> {
        let req = self
            .client
            .request(reqwest::Method::POST, &format!("/run/{}", self.kind), ctx)
            .json(&json!({
                "world_id": world.id,
                "world_code": world.code,
                "payload": ctx.payload,
                "manual": ctx.manual,
            }));
        let body = self.client.call(req, ctx).await?;
        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl PageDriver for WorkerDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, world: &World, ctx: &ExecutionContext) -> DriverOutcome {
        match self.run(world, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("⚠️ [{}] {} failed: {}", world.code, self.name, e);
                DriverOutcome::from_error(&e)
            }
        }
    }
}

#[async_trait]
impl BuildSite for WorkerClient {
    async fn read_state(&self, world: &World, ctx: &ExecutionContext) -> Result<RemoteBuildState> {
        let req = self
            .request(reqwest::Method::GET, "/build/state", ctx)
            .query(&[("world", world.code.as_str())]);
        let body = self.call(req, ctx).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn submit(&self, world: &World, ctx: &ExecutionContext, subject_id: &str) -> Result<()> {
        let req = self
            .request(reqwest::Method::POST, "/build/submit", ctx)
            .json(&json!({ "world": world.code, "subject_id": subject_id }));
        self.call(req, ctx).await?;
        Ok(())
    }
}

#[async_trait]
impl PlanningSource for WorkerClient {
    async fn fetch(&self, world: &World, ctx: &ExecutionContext) -> Result<Vec<PlannedAction>> {
        let req = self
            .request(reqwest::Method::GET, "/plans", ctx)
            .query(&[("world", world.code.as_str())]);
        let body = self.call(req, ctx).await?;
        Ok(serde_json::from_value(body["actions"].clone()).unwrap_or_default())
    }

    async fn clear(
        &self,
        world: &World,
        ctx: &ExecutionContext,
        actions: &[PlannedAction],
    ) -> Result<bool> {
        let req = self
            .request(reqwest::Method::POST, "/plans/clear", ctx)
            .json(&json!({ "world": world.code, "actions": actions }));
        let body = self.call(req, ctx).await?;
        Ok(body["cleared"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl ActionSender for WorkerClient {
    async fn send(&self, world: &World, ctx: &ExecutionContext, action: &PlannedAction) -> Result<()> {
        let req = self
            .request(reqwest::Method::POST, "/actions/send", ctx)
            .json(&json!({ "world": world.code, "action": action }));
        self.call(req, ctx).await?;
        Ok(())
    }
}
