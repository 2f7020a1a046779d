use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::AnalysisError;
use crate::model::AnalysisRequest;
use crate::options::OPTION_TABLE;
use crate::runner::CancelToken;
use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

const ANALYZE_TOOL: &str = "analyze";
const VERSION_TOOL: &str = "pyright_version";
const FIND_CONFIG_TOOL: &str = "find_pyright_config";

const MAX_RESPONSE_BYTES: usize = 512_000; // 500KB hard cap

#[derive(Debug, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
struct FindConfigParams {
    /// Directory (or file) to search upward from; defaults to the server root.
    start_dir: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
struct NoParams {}

/// JSON-RPC level failure; tool failures travel inside a successful response.
#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Cancel tokens of running calls, keyed by JSON-RPC id. A client may reuse
/// an id while an earlier call with it is still running, so every call gets
/// its own sequence number and only removes its own entry.
#[derive(Debug, Default)]
struct InFlight {
    next_seq: u64,
    calls: HashMap<String, Vec<(u64, CancelToken)>>,
}

impl InFlight {
    fn register(&mut self, key: &str) -> (u64, CancelToken) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let token = CancelToken::new();
        self.calls
            .entry(key.to_string())
            .or_default()
            .push((seq, token.clone()));
        (seq, token)
    }

    fn finish(&mut self, key: &str, seq: u64) {
        if let Some(entries) = self.calls.get_mut(key) {
            entries.retain(|(entry_seq, _)| *entry_seq != seq);
            if entries.is_empty() {
                self.calls.remove(key);
            }
        }
    }

    /// Cancel every running call with this id; returns how many were found.
    fn cancel(&self, key: &str) -> usize {
        let Some(entries) = self.calls.get(key) else {
            return 0;
        };
        for (_, token) in entries {
            token.cancel();
        }
        entries.len()
    }
}

type SharedInFlight = Arc<Mutex<InFlight>>;

fn lock_in_flight(in_flight: &SharedInFlight) -> MutexGuard<'_, InFlight> {
    in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session {
    dispatcher: Arc<Dispatcher>,
    in_flight: SharedInFlight,
    outgoing: Sender<Value>,
    workers: Vec<JoinHandle<()>>,
}

pub fn serve(config: Config) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(config));
    let stdin = io::stdin();
    serve_io(dispatcher, stdin.lock(), io::stdout())?;
    Ok(())
}

/// Run a session over line-delimited JSON-RPC. Each `tools/call` runs on its
/// own thread; responses are written by a single writer in completion order.
/// Returns the writer once input is exhausted and every call has finished.
pub fn serve_io<R, W>(dispatcher: Arc<Dispatcher>, input: R, output: W) -> Result<W>
where
    R: BufRead,
    W: Write + Send + 'static,
{
    let (outgoing, incoming) = mpsc::channel();
    let writer = thread::spawn(move || write_loop(incoming, output));
    let mut session = Session {
        dispatcher,
        in_flight: Arc::new(Mutex::new(InFlight::default())),
        outgoing,
        workers: Vec::new(),
    };

    for line in input.lines() {
        let line = match line {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("stdin error: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        session.workers.retain(|worker| !worker.is_finished());
        match serde_json::from_str::<Value>(&line) {
            Ok(message) => session.handle_message(message),
            Err(err) => session.send(jsonrpc_error(
                Value::Null,
                -32700,
                &format!("parse error: {err}"),
            )),
        }
    }

    let Session {
        workers, outgoing, ..
    } = session;
    if !workers.is_empty() {
        tracing::debug!("input closed; waiting for {} in-flight call(s)", workers.len());
    }
    for worker in workers {
        let _ = worker.join();
    }
    drop(outgoing);
    writer
        .join()
        .map_err(|_| anyhow!("response writer panicked"))?
}

fn write_loop<W: Write>(incoming: Receiver<Value>, mut output: W) -> Result<W> {
    for payload in incoming {
        writeln!(output, "{}", serde_json::to_string(&payload)?)?;
        output.flush()?;
    }
    Ok(output)
}

impl Session {
    fn send(&self, payload: Value) {
        if self.outgoing.send(payload).is_err() {
            tracing::error!("response writer is gone; dropping response");
        }
    }

    fn handle_message(&mut self, message: Value) {
        let id = message.get("id").cloned();
        let Some(method) = message.get("method").and_then(|value| value.as_str()) else {
            if let Some(id) = id {
                self.send(jsonrpc_error(id, -32600, "invalid request"));
            }
            return;
        };

        match method {
            "initialize" => {
                if let Some(id) = id {
                    self.send(jsonrpc_result(id, initialize_result(&message)));
                }
            }
            "notifications/initialized" => {}
            "notifications/cancelled" => self.cancel(&message),
            "ping" => {
                if let Some(id) = id {
                    self.send(jsonrpc_result(id, json!({})));
                }
            }
            "tools/list" => {
                if let Some(id) = id {
                    self.send(jsonrpc_result(id, json!({ "tools": tool_specs() })));
                }
            }
            "tools/call" => {
                if let Some(id) = id {
                    self.spawn_call(id, message.get("params").cloned());
                }
            }
            "resources/list" => {
                if let Some(id) = id {
                    self.send(jsonrpc_result(id, json!({ "resources": [] })));
                }
            }
            "prompts/list" => {
                if let Some(id) = id {
                    self.send(jsonrpc_result(id, json!({ "prompts": [] })));
                }
            }
            _ => {
                if let Some(id) = id {
                    self.send(jsonrpc_error(id, -32601, "method not found"));
                }
            }
        }
    }

    fn cancel(&self, message: &Value) {
        let Some(request_id) = message
            .get("params")
            .and_then(|params| params.get("requestId"))
        else {
            return;
        };
        let key = request_id.to_string();
        match lock_in_flight(&self.in_flight).cancel(&key) {
            0 => tracing::debug!("cancel for unknown or finished call {key}"),
            found => tracing::debug!("cancelling {found} call(s) with id {key}"),
        }
    }

    fn spawn_call(&mut self, id: Value, params: Option<Value>) {
        let key = id.to_string();
        let (seq, token) = lock_in_flight(&self.in_flight).register(&key);

        let dispatcher = Arc::clone(&self.dispatcher);
        let in_flight = Arc::clone(&self.in_flight);
        let outgoing = self.outgoing.clone();
        let worker = thread::spawn(move || {
            let reply = panic::catch_unwind(AssertUnwindSafe(|| {
                handle_tool_call(&dispatcher, params.as_ref(), &token)
            }))
            .unwrap_or_else(|_| {
                let err = AnalysisError::internal(anyhow!("tool call {key} panicked"));
                Ok(call_result_error(&err))
            });
            lock_in_flight(&in_flight).finish(&key, seq);
            if token.is_cancelled() {
                tracing::debug!("call {key} cancelled; no response sent");
                return;
            }
            let payload = match reply {
                Ok(result) => jsonrpc_result(id, result),
                Err(err) => jsonrpc_error(id, err.code, &err.message),
            };
            let _ = outgoing.send(payload);
        });
        self.workers.push(worker);
    }
}

fn initialize_result(message: &Value) -> Value {
    let protocol = message
        .get("params")
        .and_then(|params| params.get("protocolVersion"))
        .cloned()
        .unwrap_or_else(|| Value::String("2024-11-05".to_string()));
    json!({
        "protocolVersion": protocol,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": "pyright-mcp",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": format!(
            "Use {ANALYZE_TOOL} {{targets, options}} to type-check Python files or directories \
with pyright and get normalized diagnostics sorted by file, line and column. \
Targets are relative to the server root. Options: {}. \
Use {VERSION_TOOL} to check the installed checker and {FIND_CONFIG_TOOL} {{start_dir}} \
to see which config file applies. Errors carry a kind: validation_error (fix the request), \
acquisition_error (checker could not run; retry may help), internal_error, cancelled.",
            OPTION_TABLE
                .iter()
                .map(|spec| spec.name)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })
}

fn tool_specs() -> Value {
    json!([
        {
            "name": ANALYZE_TOOL,
            "description": "Run pyright on the given targets and return normalized diagnostics with a per-severity summary.",
            "inputSchema": analyze_schema(),
        },
        {
            "name": VERSION_TOOL,
            "description": "Report the configured pyright executable and its version.",
            "inputSchema": schema_value(schemars::schema_for!(NoParams)),
        },
        {
            "name": FIND_CONFIG_TOOL,
            "description": "Find the pyrightconfig.json or pyproject.toml [tool.pyright] that applies to a directory.",
            "inputSchema": schema_value(schemars::schema_for!(FindConfigParams)),
        }
    ])
}

fn analyze_schema() -> Value {
    let mut schema = schema_value(schemars::schema_for!(AnalysisRequest));
    schema["required"] = json!(["targets"]);
    if let Some(options) = schema.pointer_mut("/properties/options") {
        let listing = OPTION_TABLE
            .iter()
            .map(|spec| format!("{}: {}", spec.name, spec.description))
            .collect::<Vec<_>>()
            .join(" ");
        options["description"] = Value::String(listing);
    }
    schema
}

fn schema_value(schema: schemars::schema::RootSchema) -> Value {
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(map) = value.as_object_mut() {
        map.remove("$schema");
        map.remove("title");
    }
    value
}

fn handle_tool_call(
    dispatcher: &Dispatcher,
    params: Option<&Value>,
    cancel: &CancelToken,
) -> Result<Value, RpcError> {
    let params = params.ok_or_else(|| RpcError::new(-32602, "missing params"))?;
    let tool_name = params
        .get("name")
        .and_then(|value| value.as_str())
        .unwrap_or("");
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let outcome = match tool_name {
        ANALYZE_TOOL => parse_arguments::<AnalysisRequest>(arguments).and_then(|request| {
            dispatcher
                .analyze(&request, cancel)
                .and_then(|result| to_structured(&result))
        }),
        VERSION_TOOL => parse_arguments::<NoParams>(arguments)
            .and_then(|_| dispatcher.version())
            .and_then(|info| to_structured(&info)),
        FIND_CONFIG_TOOL => parse_arguments::<FindConfigParams>(arguments)
            .and_then(|params| dispatcher.find_config(params.start_dir.as_deref()))
            .and_then(|found| to_structured(&found)),
        _ => return Err(RpcError::new(-32601, format!("unknown tool: {tool_name}"))),
    };

    Ok(match outcome {
        Ok(result) => call_result_ok(result),
        Err(err) => {
            tracing::debug!("{tool_name} failed: {err}");
            call_result_error(&err)
        }
    })
}

fn parse_arguments<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, AnalysisError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments)
        .map_err(|err| AnalysisError::validation("arguments", "invalid_arguments", err.to_string()))
}

fn to_structured<T: serde::Serialize>(value: &T) -> Result<Value, AnalysisError> {
    serde_json::to_value(value).map_err(|err| AnalysisError::internal(err.into()))
}

fn call_result_ok(result: Value) -> Value {
    let content = match serde_json::to_string_pretty(&result) {
        Ok(text) if text.len() > MAX_RESPONSE_BYTES => vec![json!({
            "type": "text",
            "text": format!(
                "Response too large ({} bytes, {} est. tokens). See structuredContent or narrow the targets.",
                text.len(),
                text.len() / 4
            )
        })],
        Ok(text) => vec![json!({ "type": "text", "text": text })],
        Err(_) => Vec::new(),
    };
    json!({
        "content": content,
        "structuredContent": result,
        "isError": false
    })
}

fn call_result_error(err: &AnalysisError) -> Value {
    json!({
        "content": [{ "type": "text", "text": err.to_string() }],
        "structuredContent": { "error": err.to_json() },
        "isError": true
    })
}

fn jsonrpc_result(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn jsonrpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run_session(config: Config, lines: &[Value]) -> Vec<Value> {
        let input = lines
            .iter()
            .map(|line| line.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let dispatcher = Arc::new(Dispatcher::new(config));
        let output = serve_io(dispatcher, Cursor::new(input), Vec::new()).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn by_id(responses: &[Value], id: i64) -> Value {
        responses
            .iter()
            .find(|response| response["id"] == json!(id))
            .cloned()
            .unwrap_or_else(|| panic!("no response for id {id}"))
    }

    #[test]
    fn lists_three_tools_with_schemas() {
        let responses = run_session(
            Config::default(),
            &[
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2025-03-26"}}),
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            ],
        );
        assert_eq!(responses.len(), 2);
        let init = by_id(&responses, 1);
        assert_eq!(init["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(init["result"]["serverInfo"]["name"], "pyright-mcp");

        let tools = by_id(&responses, 2)["result"]["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec![ANALYZE_TOOL, VERSION_TOOL, FIND_CONFIG_TOOL]);
        let schema = &tools[0]["inputSchema"];
        assert_eq!(schema["required"], json!(["targets"]));
        assert!(schema["properties"]["targets"].is_object());
        assert!(
            schema["properties"]["options"]["description"]
                .as_str()
                .unwrap()
                .contains("fail_on_severity")
        );
    }

    #[test]
    fn envelope_errors_use_jsonrpc_codes() {
        let input = "not json\n{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"nope\"}\n{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"tools/call\",\"params\":{\"name\":\"no_such_tool\"}}\n{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"tools/call\"}";
        let dispatcher = Arc::new(Dispatcher::new(Config::default()));
        let output = serve_io(dispatcher, Cursor::new(input), Vec::new()).unwrap();
        let responses: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 4);
        assert!(responses.iter().any(|r| r["id"].is_null() && r["error"]["code"] == -32700));
        assert_eq!(by_id(&responses, 3)["error"]["code"], -32601);
        assert_eq!(by_id(&responses, 4)["error"]["code"], -32601);
        assert_eq!(by_id(&responses, 5)["error"]["code"], -32602);
    }

    #[test]
    fn tool_errors_carry_kind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let config = Config::default().with_allowed_roots(vec![dir.path().to_path_buf()]);
        let responses = run_session(
            config,
            &[
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                       "params": {"name": "analyze", "arguments": {"targets": []}}}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                       "params": {"name": "analyze", "arguments": {"targets": ["a.py"]}}}),
                json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                       "params": {"name": "analyze", "arguments": {"targets": "a.py", "extra": 1}}}),
            ],
        );
        let validation = by_id(&responses, 1)["result"].clone();
        assert_eq!(validation["isError"], true);
        assert_eq!(validation["structuredContent"]["error"]["kind"], "validation_error");
        assert_eq!(validation["structuredContent"]["error"]["retryable"], false);

        let acquisition = by_id(&responses, 2)["result"].clone();
        assert_eq!(acquisition["isError"], true);
        assert_eq!(acquisition["structuredContent"]["error"]["kind"], "acquisition_error");
        assert_eq!(acquisition["structuredContent"]["error"]["retryable"], true);

        let malformed = by_id(&responses, 3)["result"].clone();
        assert_eq!(malformed["structuredContent"]["error"]["kind"], "validation_error");
    }

    #[test]
    fn find_config_tool_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyrightconfig.json"), "{}").unwrap();
        let config = Config::default().with_allowed_roots(vec![dir.path().to_path_buf()]);
        let responses = run_session(
            config,
            &[
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                       "params": {"name": "find_pyright_config", "arguments": {}}}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                       "params": {"name": "find_pyright_config", "arguments": {"start_dir": "/"}}}),
            ],
        );
        let found = by_id(&responses, 1)["result"]["structuredContent"].clone();
        assert_eq!(found["found"], true);
        assert_eq!(found["kind"], "pyrightconfig.json");

        let outside = by_id(&responses, 2)["result"].clone();
        assert_eq!(outside["isError"], true);
        assert_eq!(
            outside["structuredContent"]["error"]["issues"][0]["field"],
            "start_dir"
        );
    }

    #[test]
    fn reused_call_id_keeps_later_call_cancellable() {
        let mut in_flight = InFlight::default();
        let (first_seq, first) = in_flight.register("7");
        let (_, second) = in_flight.register("7");
        in_flight.finish("7", first_seq);
        assert!(!first.is_cancelled());

        assert_eq!(in_flight.cancel("7"), 1);
        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());
        assert_eq!(in_flight.cancel("8"), 0);
    }

    #[test]
    fn large_results_are_summarized_in_text() {
        let big = json!({ "blob": "x".repeat(MAX_RESPONSE_BYTES + 1) });
        let payload = call_result_ok(big);
        let text = payload["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Response too large"));
        assert!(payload["structuredContent"]["blob"].is_string());
    }
}
