//! Local sandbox backend: a real `python3` child interpreter, spawned
//! fresh for every `execute_code` call so the parent can enforce a hard
//! wall-clock kill — something an in-process embedding cannot offer.

use async_trait::async_trait;
use base64::Engine;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, RlmError};
use crate::sandbox::{PersistentSandbox, Sandbox};
use crate::types::{ContextPayload, Message, ReplResult};

const WALL_CLOCK_LIMIT: Duration = Duration::from_secs(5 * 60);
const STDOUT_CAP_BYTES: usize = 50 * 1024 * 1024;
const PYTHON_BIN: &str = "python3";

/// One REPL session backed by a scratch directory and a JSON state side-file.
/// Every `execute_code` call spawns and tears down its own `python3` process;
/// state survives between calls only through the side-file.
pub struct LocalSandbox {
    scratch_dir: tempfile::TempDir,
    state_path: PathBuf,
    router_addr: SocketAddr,
    depth: u32,
    context_count: usize,
    history_count: usize,
}

impl LocalSandbox {
    pub fn new(
        _config: &HashMap<String, serde_json::Value>,
        router_addr: SocketAddr,
        depth: u32,
    ) -> Result<Self> {
        let scratch_dir = tempfile::tempdir().map_err(RlmError::Io)?;
        let state_path = scratch_dir.path().join("state.json");
        Ok(Self {
            scratch_dir,
            state_path,
            router_addr,
            depth,
            context_count: 0,
            history_count: 0,
        })
    }

    fn router_url(&self) -> String {
        format!("http://{}", self.router_addr)
    }

    /// Build the self-contained child program: fixed hook preamble, state
    /// file path, router endpoint, depth, and the base64-transported source.
    fn materialize_program(&self, source: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(source.as_bytes());
        format!(
            r#"{preamble}

_STATE_PATH = {state_path:?}
_ROUTER_URL = {router_url:?}
_DEPTH = {depth}
_SOURCE_B64 = {source_b64:?}

_run_user_source(_SOURCE_B64, _STATE_PATH, _ROUTER_URL, _DEPTH)
"#,
            preamble = HOOK_PREAMBLE,
            state_path = self.state_path.to_string_lossy(),
            router_url = self.router_url(),
            depth = self.depth,
            source_b64 = encoded,
        )
    }

    /// Write a side file and merge it into `state.json` under `{ident}_{N}`
    /// (and bare `{ident}` when N == 0), so the binding survives into the
    /// next `execute_code` call's child, which rebuilds its scope solely
    /// from `state.json`. A throwaway child that only bound a local variable
    /// would lose it the moment that process exits.
    async fn load_side_file(&mut self, ident: &str, index: usize, content: &str) -> Result<()> {
        let side_path = self.scratch_dir.path().join(format!("{ident}_{index}.json"));
        tokio::fs::write(&side_path, content).await.map_err(RlmError::Io)?;
        let mut stub = format!(
            "import json\ntry:\n    with open({state_path:?}) as _f:\n        _state = json.load(_f)\nexcept (FileNotFoundError, json.JSONDecodeError):\n    _state = {{}}\nwith open({side_path:?}) as _f:\n    _val = json.load(_f)\n_state[{key:?}] = _val\n",
            state_path = self.state_path.to_string_lossy(),
            side_path = side_path.to_string_lossy(),
            key = format!("{ident}_{index}"),
        );
        if index == 0 {
            stub.push_str(&format!("_state[{ident:?}] = _val\n"));
        }
        stub.push_str(&format!(
            "with open({state_path:?}, \"w\") as _f:\n    json.dump(_state, _f)\n",
            state_path = self.state_path.to_string_lossy(),
        ));
        self.run_raw(&stub).await.map(|_| ())
    }

    /// Run a raw program string through the child interpreter without the
    /// base64/hook wrapping used by `execute_code`, for internal stub loads.
    async fn run_raw(&self, program: &str) -> Result<ReplResult> {
        self.spawn_and_collect(program).await
    }

    async fn spawn_and_collect(&self, program: &str) -> Result<ReplResult> {
        let start = Instant::now();
        let mut child = Command::new(PYTHON_BIN)
            .arg("-c")
            .arg(program)
            .current_dir(self.scratch_dir.path())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| RlmError::SandboxSpawn(e.to_string()))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            if let Some(mut out) = stdout_pipe.take() {
                let _ = out.read_to_end(&mut stdout_buf).await;
            }
            if let Some(mut err) = stderr_pipe.take() {
                let _ = err.read_to_end(&mut stderr_buf).await;
            }
            let _ = child.wait().await;
            (stdout_buf, stderr_buf)
        };

        let (mut stdout_buf, stderr_buf) = match tokio::time::timeout(WALL_CLOCK_LIMIT, wait).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("local sandbox execution exceeded the five-minute wall-clock limit");
                return Ok(ReplResult {
                    stdout: String::new(),
                    stderr: "Error: execution exceeded the five-minute wall-clock limit"
                        .to_string(),
                    locals: HashMap::new(),
                    execution_time: start.elapsed(),
                    rlm_calls: Vec::new(),
                });
            }
        };

        if stdout_buf.len() > STDOUT_CAP_BYTES {
            stdout_buf.truncate(STDOUT_CAP_BYTES);
        }

        let stdout_text = String::from_utf8_lossy(&stdout_buf).into_owned();
        let stderr_text = String::from_utf8_lossy(&stderr_buf).into_owned();
        let execution_time = start.elapsed();

        Ok(parse_final_record(&stdout_text, &stderr_text, execution_time))
    }
}

/// Split the child's stdout on newlines and parse the last line as the
/// structured `{stdout, stderr, locals, rlm_calls}` record. On parse failure
/// the whole raw stdout becomes the result's stdout and a parse-error note
/// joins the stderr. Shared with the container backend, whose child emits
/// the same structured record over a Docker exec stream instead of a local
/// pipe.
pub(crate) fn parse_final_record(stdout: &str, stderr: &str, execution_time: Duration) -> ReplResult {
    let mut lines: Vec<&str> = stdout.lines().collect();
    let last = lines.pop();

    if let Some(last_line) = last {
        if let Ok(mut record) = serde_json::from_str::<ReplResult>(last_line) {
            record.execution_time = execution_time;
            if !stderr.is_empty() {
                if record.stderr.is_empty() {
                    record.stderr = stderr.to_string();
                } else {
                    record.stderr = format!("{}\n{}", record.stderr, stderr);
                }
            }
            return record;
        }
    }

    let mut stderr_text = stderr.to_string();
    if !stderr_text.is_empty() {
        stderr_text.push('\n');
    }
    stderr_text.push_str("Parse error");
    ReplResult {
        stdout: stdout.to_string(),
        stderr: stderr_text,
        locals: HashMap::new(),
        execution_time,
        rlm_calls: Vec::new(),
    }
}

/// Python source defining the four hook functions and the execution harness
/// that loads state, runs user source with redirected stdio, captures the
/// traceback on failure, repopulates the state file, and emits the final
/// structured record line. Shared verbatim by the container backend so both
/// child interpreters expose identical hook semantics.
pub(crate) const HOOK_PREAMBLE: &str = r#"
import json, base64, io, sys, traceback, urllib.request, urllib.error

def _post(url, payload):
    data = json.dumps(payload).encode("utf-8")
    req = urllib.request.Request(url, data=data, headers={"Content-Type": "application/json"})
    with urllib.request.urlopen(req, timeout=300) as resp:
        return json.loads(resp.read().decode("utf-8"))

_rlm_calls = []

def llm_query(prompt, model=None):
    try:
        body = _post(_ROUTER_URL + "/llm_query", {"prompt": prompt, "model": model, "depth": _DEPTH})
    except Exception as e:
        return f"Error: {e}"
    if "rlm_call" in body and body["rlm_call"] is not None:
        _rlm_calls.append(body["rlm_call"])
    return body.get("response", "")

def llm_query_batched(prompts, model=None):
    try:
        body = _post(_ROUTER_URL + "/llm_query_batched", {"prompts": prompts, "model": model, "depth": _DEPTH})
    except Exception as e:
        return [f"Error: {e}" for _ in prompts]
    for call in body.get("rlm_calls", []) or []:
        _rlm_calls.append(call)
    return body.get("responses", [])

def _strip_quotes(s):
    s = s.strip()
    if len(s) >= 2 and ((s[0] == '"' and s[-1] == '"') or (s[0] == "'" and s[-1] == "'")):
        return s[1:-1]
    return s

def FINAL_VAR(name):
    name = _strip_quotes(name)
    scope = _user_scope
    if name in scope:
        return str(scope[name])
    available = ", ".join(sorted(k for k in scope if not k.startswith("_")))
    return f"Variable '{name}' is not defined. Available: {available}"

def SHOW_VARS():
    return {k: type(v).__name__ for k, v in _user_scope.items() if not k.startswith("_")}

def _listable(v):
    return isinstance(v, (str, int, float, bool, list, dict)) or v is None

def _jsonable(v):
    try:
        json.dumps(v)
        return True
    except Exception:
        return False

def _run_user_source(source_b64, state_path, router_url, depth):
    try:
        with open(state_path) as f:
            state = json.load(f)
    except (FileNotFoundError, json.JSONDecodeError):
        state = {}

    scope = dict(globals())
    scope.update(state)
    global _user_scope
    _user_scope = scope

    source = base64.b64decode(source_b64).decode("utf-8")
    out_buf, err_buf = io.StringIO(), io.StringIO()
    old_out, old_err = sys.stdout, sys.stderr
    sys.stdout, sys.stderr = out_buf, err_buf
    try:
        exec(compile(source, "<repl>", "exec"), scope)
    except Exception:
        traceback.print_exc(file=err_buf)
    finally:
        sys.stdout, sys.stderr = old_out, old_err

    new_state = {}
    for k, v in scope.items():
        if k.startswith("_") or k in globals():
            continue
        if callable(v) or isinstance(v, type(sys)):
            continue
        if _jsonable(v):
            new_state[k] = v
        else:
            new_state[k] = str(v)

    with open(state_path, "w") as f:
        json.dump(new_state, f)

    locals_out = {k: v for k, v in new_state.items()}
    record = {
        "stdout": out_buf.getvalue(),
        "stderr": err_buf.getvalue(),
        "locals": locals_out,
        "execution_time": "0s",
        "rlm_calls": _rlm_calls,
    }
    print(json.dumps(record))
"#;

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn setup(&mut self) -> Result<()> {
        tokio::fs::write(&self.state_path, "{}").await.map_err(RlmError::Io)?;
        Ok(())
    }

    async fn load_context(&mut self, payload: &ContextPayload) -> Result<()> {
        let content = payload.to_repl_literal();
        self.load_side_file("context", 0, &content).await?;
        self.context_count = self.context_count.max(1);
        Ok(())
    }

    async fn execute_code(&mut self, source: &str) -> Result<ReplResult> {
        let program = self.materialize_program(source);
        debug!(bytes = program.len(), "spawning local sandbox child");
        self.spawn_and_collect(&program).await
    }

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PersistentSandbox for LocalSandbox {
    async fn update_handler_address(&mut self, addr: SocketAddr) -> Result<()> {
        self.router_addr = addr;
        Ok(())
    }

    async fn add_context(&mut self, payload: &ContextPayload, index: Option<usize>) -> Result<usize> {
        let idx = index.unwrap_or(self.context_count);
        let content = payload.to_repl_literal();
        self.load_side_file("context", idx, &content).await?;
        self.context_count = self.context_count.max(idx + 1);
        Ok(idx)
    }

    fn history_count(&self) -> usize {
        self.history_count
    }

    fn context_count(&self) -> usize {
        self.context_count
    }

    async fn add_history(&mut self, messages: &[Message], index: Option<usize>) -> Result<usize> {
        let idx = index.unwrap_or(self.history_count);
        let content = serde_json::to_string(messages).map_err(RlmError::Json)?;
        self.load_side_file("history", idx, &content).await?;
        self.history_count = self.history_count.max(idx + 1);
        Ok(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_final_record() {
        let line = r#"{"stdout":"2\n","stderr":"","locals":{"x":42},"execution_time":"0s","rlm_calls":[]}"#;
        let result = parse_final_record(line, "", Duration::from_millis(5));
        assert_eq!(result.stdout, "2\n");
        assert!(result.locals.contains_key("x"));
    }

    #[test]
    fn falls_back_to_raw_stdout_on_parse_failure() {
        let result = parse_final_record("not json at all", "", Duration::ZERO);
        assert_eq!(result.stdout, "not json at all");
        assert!(result.stderr.contains("Parse error"));
    }

    #[test]
    fn appends_timeout_stderr_to_existing_record_stderr() {
        let line = r#"{"stdout":"","stderr":"boom","locals":{},"execution_time":"0s","rlm_calls":[]}"#;
        let result = parse_final_record(line, "warning", Duration::ZERO);
        assert_eq!(result.stderr, "boom\nwarning");
    }

    #[tokio::test]
    async fn materialized_program_embeds_base64_source_and_depth() {
        let sandbox = LocalSandbox::new(
            &HashMap::new(),
            "127.0.0.1:0".parse().unwrap(),
            2,
        )
        .unwrap();
        let program = sandbox.materialize_program("x = 1");
        assert!(program.contains("_DEPTH = 2"));
        assert!(program.contains(&base64::engine::general_purpose::STANDARD.encode(b"x = 1")));
    }
}
