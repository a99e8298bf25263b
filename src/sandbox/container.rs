//! Container sandbox backend: the same child-interpreter contract as the
//! local backend, but the interpreter runs inside an isolated Docker
//! container reachable only through a forwarding proxy. Connects via
//! `Docker::connect_with_local_defaults`, builds a `HostConfig` with
//! resource limits and `network_mode: "none"`, uses `create_exec`/
//! `start_exec` to run commands, and `remove_container { force: true }` to
//! tear down.

use async_trait::async_trait;
use base64::Engine;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{Result, RlmError};
use crate::sandbox::proxy::ForwardingProxy;
use crate::sandbox::{PersistentSandbox, Sandbox};
use crate::types::{ContextPayload, Message, ReplResult};

const WALL_CLOCK_LIMIT: Duration = Duration::from_secs(5 * 60);
const STDOUT_CAP_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_IMAGE: &str = "python:3.12-slim";
const WORKDIR: &str = "/workspace";

/// One REPL session backed by a Docker container and a scratch directory
/// bind-mounted into it. State survives between calls through a JSON
/// side-file on the shared mount, same as [`super::local::LocalSandbox`].
pub struct ContainerSandbox {
    docker: Docker,
    container_id: Option<String>,
    scratch_dir: tempfile::TempDir,
    proxy: ForwardingProxy,
    image: String,
    depth: u32,
    context_count: usize,
    history_count: usize,
}

impl ContainerSandbox {
    pub fn new(
        config: &HashMap<String, serde_json::Value>,
        router_addr: SocketAddr,
        depth: u32,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RlmError::Configuration(format!("docker unavailable: {e}")))?;
        let scratch_dir = tempfile::tempdir().map_err(RlmError::Io)?;
        let image = config
            .get("image")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_IMAGE)
            .to_string();
        let proxy = ForwardingProxy::new(router_addr);

        Ok(Self {
            docker,
            container_id: None,
            scratch_dir,
            proxy,
            image,
            depth,
            context_count: 0,
            history_count: 0,
        })
    }

    fn state_path(&self) -> std::path::PathBuf {
        self.scratch_dir.path().join("state.json")
    }

    fn require_container(&self) -> Result<&str> {
        self.container_id
            .as_deref()
            .ok_or_else(|| RlmError::Configuration("container sandbox not set up".to_string()))
    }

    fn router_url(&self) -> String {
        format!(
            "http://host.docker.internal:{}",
            self.proxy.port()
        )
    }

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
            preamble = super::local::HOOK_PREAMBLE,
            state_path = format!("{}/state.json", WORKDIR),
            router_url = self.router_url(),
            depth = self.depth,
            source_b64 = encoded,
        )
    }

    async fn exec_python(&self, program: &str) -> Result<ReplResult> {
        let id = self.require_container()?;
        let start = Instant::now();

        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "python3".to_string(),
                "-c".to_string(),
                program.to_string(),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(WORKDIR.to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(RlmError::Container)?;

        let run = async {
            let output = self.docker.start_exec(&exec.id, None).await?;
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let StartExecResults::Attached { mut output, .. } = output {
                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                    if stdout.len() > STDOUT_CAP_BYTES {
                        stdout.truncate(STDOUT_CAP_BYTES);
                        break;
                    }
                }
            }
            Ok::<_, bollard::errors::Error>((stdout, stderr))
        };

        match tokio::time::timeout(WALL_CLOCK_LIMIT, run).await {
            Ok(Ok((stdout, stderr))) => {
                let stdout_text = String::from_utf8_lossy(&stdout).into_owned();
                let stderr_text = String::from_utf8_lossy(&stderr).into_owned();
                Ok(super::local::parse_final_record(
                    &stdout_text,
                    &stderr_text,
                    start.elapsed(),
                ))
            }
            Ok(Err(e)) => Err(RlmError::Container(e)),
            Err(_) => {
                warn!("container sandbox execution exceeded the five-minute wall-clock limit");
                Ok(ReplResult {
                    stdout: String::new(),
                    stderr: "Error: execution exceeded the five-minute wall-clock limit"
                        .to_string(),
                    locals: HashMap::new(),
                    execution_time: start.elapsed(),
                    rlm_calls: Vec::new(),
                })
            }
        }
    }

    /// Write a side file and merge it into `state.json` under `{ident}_{N}`
    /// (and bare `{ident}` when N == 0). The exec that loads it runs in its
    /// own container process and never touches the main harness's in-memory
    /// scope, so the binding only survives into the next `execute_code` call
    /// if it lands in `state.json`, same as the local backend.
    async fn load_side_file(&mut self, ident: &str, index: usize, content: &str) -> Result<()> {
        let side_name = format!("{ident}_{index}.json");
        tokio::fs::write(self.scratch_dir.path().join(&side_name), content)
            .await
            .map_err(RlmError::Io)?;
        let state_path = format!("{WORKDIR}/state.json");
        let side_path = format!("{WORKDIR}/{side_name}");
        let key = format!("{ident}_{index}");
        let mut stub = format!(
            "import json\ntry:\n    with open({state_path:?}) as _f:\n        _state = json.load(_f)\nexcept (FileNotFoundError, json.JSONDecodeError):\n    _state = {{}}\nwith open({side_path:?}) as _f:\n    _val = json.load(_f)\n_state[{key:?}] = _val\n",
        );
        if index == 0 {
            stub.push_str(&format!("_state[{ident:?}] = _val\n"));
        }
        stub.push_str(&format!(
            "with open({state_path:?}, \"w\") as _f:\n    json.dump(_state, _f)\n",
        ));
        self.exec_python(&stub).await.map(|_| ())
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn setup(&mut self) -> Result<()> {
        self.proxy.start().await?;
        self.docker
            .ping()
            .await
            .map_err(|e| RlmError::Configuration(format!("docker not available: {e}")))?;

        tokio::fs::write(self.state_path(), "{}").await.map_err(RlmError::Io)?;

        let host_config = bollard::models::HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                self.scratch_dir.path().display(),
                WORKDIR
            )]),
            memory: Some(512 * 1024 * 1024),
            nano_cpus: Some(1_000_000_000),
            pids_limit: Some(128),
            network_mode: Some("none".to_string()),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.image.clone()),
            working_dir: Some(WORKDIR.to_string()),
            host_config: Some(host_config),
            tty: Some(true),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let name = format!("rlm-sandbox-{}", uuid::Uuid::new_v4().as_simple());
        let create_opts = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .map_err(RlmError::Container)?;
        self.container_id = Some(response.id.clone());

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(RlmError::Container)?;

        info!(container = %&response.id[..12.min(response.id.len())], "started sandbox container");
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
        self.exec_python(&program).await
    }

    async fn cleanup(&mut self) -> Result<()> {
        if let Some(id) = self.container_id.take() {
            let opts = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = self.docker.remove_container(&id, Some(opts)).await {
                warn!(error = %e, "failed to remove sandbox container");
            }
        }
        self.proxy.stop().await;
        Ok(())
    }
}

#[async_trait]
impl PersistentSandbox for ContainerSandbox {
    async fn update_handler_address(&mut self, addr: SocketAddr) -> Result<()> {
        self.proxy.retarget(addr);
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

/// Check whether a Docker daemon is reachable by shelling out to
/// `docker info` rather than spinning up an async client just to probe
/// availability.
pub fn is_available() -> bool {
    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_picks_configured_image_over_default() {
        let mut config = HashMap::new();
        config.insert("image".to_string(), serde_json::json!("python:3.11-slim"));
        let sandbox = ContainerSandbox::new(&config, "127.0.0.1:0".parse().unwrap(), 1);
        if let Ok(sandbox) = sandbox {
            assert_eq!(sandbox.image, "python:3.11-slim");
        }
    }

    #[test]
    fn new_falls_back_to_default_image() {
        let sandbox = ContainerSandbox::new(&HashMap::new(), "127.0.0.1:0".parse().unwrap(), 1);
        if let Ok(sandbox) = sandbox {
            assert_eq!(sandbox.image, DEFAULT_IMAGE);
        }
    }
}
