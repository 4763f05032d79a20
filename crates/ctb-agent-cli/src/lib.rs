//! Containerized agent process adapter.
//!
//! Spawns a configurable command (default `docker run --rm -i <image>`) with
//! the prompt piped over stdin and a line-framed NDJSON result stream read
//! from stdout, mirroring the stdout-line-reading/cancellation-loop pattern
//! used for CLI model backends elsewhere in this workspace.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, Command},
};
use tracing::{debug, warn};

use ctb_core::{
    runner::{AgentHandle, AgentProcess, AgentRecord, SpawnRequest},
    Error, Result,
};

/// Spawns one container (or local process) per agent run.
#[derive(Clone, Debug)]
pub struct ContainerAgentProcess {
    command: String,
    args: Vec<String>,
}

impl ContainerAgentProcess {
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self { command, args }
    }
}

#[async_trait]
impl AgentProcess for ContainerAgentProcess {
    async fn spawn(&self, req: &SpawnRequest) -> Result<Box<dyn AgentHandle>> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("CTB_GROUP_FOLDER", &req.group_folder)
            .env("CTB_CHAT_JID", req.chat_jid.as_str())
            .env("CTB_ASSISTANT_NAME", &req.assistant_name)
            .env("CTB_IS_MAIN", if req.is_main { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(session_id) = &req.session_id {
            cmd.env("CTB_SESSION_ID", session_id);
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Agent("agent stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent("agent stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "ctb_agent_cli::stderr", "{line}");
                }
            });
        }

        let mut handle = ContainerAgentHandle {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        };

        handle.write_line(&req.prompt).await?;

        Ok(Box::new(handle))
    }
}

struct ContainerAgentHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<tokio::process::ChildStdout>>,
}

#[async_trait]
impl AgentHandle for ContainerAgentHandle {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(Error::Agent("agent stdin is already closed".to_string()));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close_stdin(&mut self) {
        self.stdin = None;
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }

    async fn next_record(&mut self) -> Option<AgentRecord> {
        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "error reading agent stdout");
                    return None;
                }
            };

            match serde_json::from_str::<AgentRecord>(&line) {
                Ok(rec) => return Some(rec),
                Err(_) => {
                    debug!(%line, "dropping unparseable agent stdout line");
                    continue;
                }
            }
        }
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}
