// Tool implementations wired to the live components
//
// Each tool is a thin adapter: deserialize the arguments object, call into
// the owning component, serialize the result. Failures surface as tool-level
// errors (isError content in a successful envelope), never as transport
// errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::detector::Manifest;
use crate::logs::LogStore;
use crate::process::ProcessManager;
use crate::proxy::server::ProxyServer;
use crate::proxy::ProxyMode;
use crate::repl::ReplGateway;
use crate::scripts::ScriptsLibrary;
use crate::telemetry::TelemetryCollector;

use super::{McpServer, Tool, ToolError};

/// Everything the tool set needs, bundled for registration.
#[derive(Clone)]
pub struct ToolContext {
    pub processes: Arc<ProcessManager>,
    pub logs: Arc<LogStore>,
    /// None when the proxy is disabled
    pub proxy: Option<Arc<ProxyServer>>,
    pub telemetry: Arc<TelemetryCollector>,
    pub repl: Arc<ReplGateway>,
    pub scripts: Arc<ScriptsLibrary>,
}

pub fn register_all(server: &McpServer, ctx: ToolContext) {
    server.register_tool(Arc::new(ScriptsListTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ScriptsRunTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ScriptsStopTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ScriptsRestartTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ScriptsStatusTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(LogsTailTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(LogsSearchTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(LogsErrorsTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ProxyRequestsTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ProxyMappingsTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ProxySetModeTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(TelemetrySessionsTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(ReplExecuteTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(LibraryListTool { ctx: ctx.clone() }));
    server.register_tool(Arc::new(LibraryGetTool { ctx }));
}

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::new(format!("invalid arguments: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::new(format!("serialization failed: {e}")))
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ── Script/process tools ───────────────────────────────────────────────────

struct ScriptsListTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ScriptsListTool {
    fn name(&self) -> &str {
        "scripts_list"
    }
    fn description(&self) -> &str {
        "List the scripts defined in the project manifest"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({}), &[])
    }
    async fn call(&self, _arguments: Value) -> Result<Value, ToolError> {
        let dir = &self.ctx.processes.detection().project_dir;
        let manifest = Manifest::load(dir)
            .map_err(|e| ToolError::new(format!("{e:#}")))?
            .ok_or_else(|| ToolError::new(format!("no package.json in {}", dir.display())))?;
        Ok(json!({
            "packageManager": self.ctx.processes.detection().manager.command(),
            "scripts": manifest.scripts,
        }))
    }
}

#[derive(Deserialize)]
struct ScriptsRunArgs {
    name: String,
}

struct ScriptsRunTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ScriptsRunTool {
    fn name(&self) -> &str {
        "scripts_run"
    }
    fn description(&self) -> &str {
        "Start a manifest script under supervision"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"name": {"type": "string"}}), &["name"])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: ScriptsRunArgs = parse_args(arguments)?;
        let snapshot = self
            .ctx
            .processes
            .start_script(&args.name)
            .map_err(|e| ToolError::new(e.to_string()))?;
        to_value(&snapshot)
    }
}

#[derive(Deserialize)]
struct ProcessIdArgs {
    #[serde(rename = "processId")]
    process_id: String,
}

struct ScriptsStopTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ScriptsStopTool {
    fn name(&self) -> &str {
        "scripts_stop"
    }
    fn description(&self) -> &str {
        "Stop a supervised process (graceful, then force-kill)"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"processId": {"type": "string"}}), &["processId"])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: ProcessIdArgs = parse_args(arguments)?;
        self.ctx
            .processes
            .stop(&args.process_id)
            .map_err(|e| ToolError::new(e.to_string()))?;
        Ok(json!({"stopped": args.process_id}))
    }
}

struct ScriptsRestartTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ScriptsRestartTool {
    fn name(&self) -> &str {
        "scripts_restart"
    }
    fn description(&self) -> &str {
        "Restart a supervised process with its original parameters"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"processId": {"type": "string"}}), &["processId"])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: ProcessIdArgs = parse_args(arguments)?;
        let snapshot = self
            .ctx
            .processes
            .restart(&args.process_id)
            .await
            .map_err(|e| ToolError::new(e.to_string()))?;
        to_value(&snapshot)
    }
}

#[derive(Deserialize)]
struct StatusArgs {
    #[serde(rename = "processId")]
    process_id: Option<String>,
}

struct ScriptsStatusTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ScriptsStatusTool {
    fn name(&self) -> &str {
        "scripts_status"
    }
    fn description(&self) -> &str {
        "Snapshot of one process, or all supervised processes"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"processId": {"type": "string"}}), &[])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: StatusArgs = parse_args(arguments)?;
        match args.process_id {
            Some(id) => {
                let snapshot = self
                    .ctx
                    .processes
                    .get(&id)
                    .ok_or_else(|| ToolError::new(format!("unknown process '{id}'")))?;
                to_value(&snapshot)
            }
            None => to_value(&self.ctx.processes.list()),
        }
    }
}

// ── Log tools ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LogsTailArgs {
    #[serde(default)]
    n: Option<usize>,
    #[serde(rename = "processId")]
    process_id: Option<String>,
}

struct LogsTailTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for LogsTailTool {
    fn name(&self) -> &str {
        "logs_tail"
    }
    fn description(&self) -> &str {
        "Most recent log entries, optionally per process (collapsed view)"
    }
    fn input_schema(&self) -> Value {
        object_schema(
            json!({"n": {"type": "integer"}, "processId": {"type": "string"}}),
            &[],
        )
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: LogsTailArgs = parse_args(arguments)?;
        let n = args.n.unwrap_or(100);
        match args.process_id {
            Some(id) => {
                let entries = self.ctx.logs.get_by_process_collapsed(&id);
                let tail: Vec<_> = entries.iter().rev().take(n).rev().cloned().collect();
                to_value(&tail)
            }
            None => to_value(&self.ctx.logs.tail(n)),
        }
    }
}

#[derive(Deserialize)]
struct LogsSearchArgs {
    query: String,
}

struct LogsSearchTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for LogsSearchTool {
    fn name(&self) -> &str {
        "logs_search"
    }
    fn description(&self) -> &str {
        "Case-insensitive substring search over stored log content"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"query": {"type": "string"}}), &["query"])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: LogsSearchArgs = parse_args(arguments)?;
        to_value(&self.ctx.logs.search(&args.query))
    }
}

struct LogsErrorsTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for LogsErrorsTool {
    fn name(&self) -> &str {
        "logs_errors"
    }
    fn description(&self) -> &str {
        "Detected error records with their assembled context"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"processId": {"type": "string"}}), &[])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: StatusArgs = parse_args(arguments)?;
        match args.process_id {
            Some(id) => to_value(&self.ctx.logs.errors_by_process(&id)),
            None => to_value(&self.ctx.logs.errors()),
        }
    }
}

// ── Proxy tools ────────────────────────────────────────────────────────────

fn proxy_of(ctx: &ToolContext) -> Result<&Arc<ProxyServer>, ToolError> {
    ctx.proxy
        .as_ref()
        .ok_or_else(|| ToolError::new("proxy is disabled"))
}

struct ProxyRequestsTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ProxyRequestsTool {
    fn name(&self) -> &str {
        "proxy_requests"
    }
    fn description(&self) -> &str {
        "Recent requests captured by the proxy"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"n": {"type": "integer"}}), &[])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            n: Option<usize>,
        }
        let args: Args = parse_args(arguments)?;
        let captures = proxy_of(&self.ctx)?.captures();
        let n = args.n.unwrap_or(100);
        let tail: Vec<_> = captures.iter().rev().take(n).rev().cloned().collect();
        to_value(&tail)
    }
}

struct ProxyMappingsTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ProxyMappingsTool {
    fn name(&self) -> &str {
        "proxy_mappings"
    }
    fn description(&self) -> &str {
        "Active URL mappings (origin, proxy URL, owning process, label)"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({}), &[])
    }
    async fn call(&self, _arguments: Value) -> Result<Value, ToolError> {
        to_value(&proxy_of(&self.ctx)?.mappings.all())
    }
}

#[derive(Deserialize)]
struct SetModeArgs {
    mode: String,
}

struct ProxySetModeTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ProxySetModeTool {
    fn name(&self) -> &str {
        "proxy_set_mode"
    }
    fn description(&self) -> &str {
        "Switch the proxy between full and reverse modes"
    }
    fn input_schema(&self) -> Value {
        object_schema(
            json!({"mode": {"type": "string", "enum": ["full", "reverse"]}}),
            &["mode"],
        )
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: SetModeArgs = parse_args(arguments)?;
        let mode: ProxyMode = args.mode.parse().map_err(ToolError::new)?;
        let proxy = proxy_of(&self.ctx)?;
        proxy
            .set_mode(mode)
            .await
            .map_err(|e| ToolError::new(format!("{e:#}")))?;
        Ok(json!({"mode": mode.as_str()}))
    }
}

// ── Telemetry and repl tools ───────────────────────────────────────────────

#[derive(Deserialize)]
struct TelemetrySessionsArgs {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "processId")]
    process_id: Option<String>,
}

struct TelemetrySessionsTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for TelemetrySessionsTool {
    fn name(&self) -> &str {
        "telemetry_sessions"
    }
    fn description(&self) -> &str {
        "Browser telemetry sessions, filterable by session or process"
    }
    fn input_schema(&self) -> Value {
        object_schema(
            json!({"sessionId": {"type": "string"}, "processId": {"type": "string"}}),
            &[],
        )
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: TelemetrySessionsArgs = parse_args(arguments)?;
        if let Some(id) = args.session_id {
            let session = self
                .ctx
                .telemetry
                .get(&id)
                .ok_or_else(|| ToolError::new(format!("unknown session '{id}'")))?;
            return to_value(&session);
        }
        if let Some(pid) = args.process_id {
            return to_value(&self.ctx.telemetry.by_process(&pid));
        }
        to_value(&self.ctx.telemetry.sessions())
    }
}

#[derive(Deserialize)]
struct ReplExecuteArgs {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    code: String,
}

struct ReplExecuteTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for ReplExecuteTool {
    fn name(&self) -> &str {
        "repl_execute"
    }
    fn description(&self) -> &str {
        "Evaluate JavaScript in a connected browser session"
    }
    fn input_schema(&self) -> Value {
        object_schema(
            json!({"sessionId": {"type": "string"}, "code": {"type": "string"}}),
            &["code"],
        )
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: ReplExecuteArgs = parse_args(arguments)?;
        // Default to the most recently active session
        let session_id = match args.session_id {
            Some(id) => id,
            None => self
                .ctx
                .telemetry
                .most_recent_active()
                .ok_or_else(|| ToolError::new("no active telemetry session"))?,
        };
        let result = self
            .ctx
            .repl
            .execute(&session_id, &args.code, Duration::from_secs(10))
            .await
            .map_err(|e| ToolError::new(e.to_string()))?;
        Ok(json!({
            "sessionId": session_id,
            "ok": result.ok,
            "value": result.value,
        }))
    }
}

// ── Scripts-library tools ──────────────────────────────────────────────────

struct LibraryListTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for LibraryListTool {
    fn name(&self) -> &str {
        "library_list"
    }
    fn description(&self) -> &str {
        "List annotated scripts from the user scripts directory"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({}), &[])
    }
    async fn call(&self, _arguments: Value) -> Result<Value, ToolError> {
        let scripts: Vec<Value> = self
            .ctx
            .scripts
            .load()
            .into_iter()
            .map(|s| json!({"name": s.name, "description": s.description}))
            .collect();
        Ok(json!({"scripts": scripts}))
    }
}

#[derive(Deserialize)]
struct LibraryGetArgs {
    name: String,
}

struct LibraryGetTool {
    ctx: ToolContext,
}

#[async_trait]
impl Tool for LibraryGetTool {
    fn name(&self) -> &str {
        "library_get"
    }
    fn description(&self) -> &str {
        "Fetch one annotated script, body included"
    }
    fn input_schema(&self) -> Value {
        object_schema(json!({"name": {"type": "string"}}), &["name"])
    }
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: LibraryGetArgs = parse_args(arguments)?;
        let script = self
            .ctx
            .scripts
            .get(&args.name)
            .map_err(|e| ToolError::new(format!("{e:#}")))?;
        to_value(&script)
    }
}
