//! Generator backed by an external program.
//!
//! The prompt is written to the program's stdin; each stdout line becomes a
//! chunk. A non-zero exit status turns into a generation error. Dropping the
//! chunk stream kills the program.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use hope_stream::{ConnectorError, GenerationStream, GenerativeConnector};

pub struct CommandConnector {
    program: String,
    args: Vec<String>,
}

impl CommandConnector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn spawn(&self, prompt: &str) -> Result<Child, ConnectorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectorError::Unavailable(format!("{}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "Generator closed stdin early");
                }
            });
        }
        Ok(child)
    }
}

async fn read_stderr(child: &mut Child) -> String {
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr).await;
    }
    stderr.trim().to_string()
}

#[async_trait]
impl GenerativeConnector for CommandConnector {
    async fn generate(&self, prompt: &str) -> Result<String, ConnectorError> {
        let output = self
            .spawn(prompt)?
            .wait_with_output()
            .await
            .map_err(|e| ConnectorError::Generation(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConnectorError::Generation(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn generate_stream(&self, prompt: &str) -> Result<GenerationStream, ConnectorError> {
        let mut child = self.spawn(prompt)?;
        let Some(stdout) = child.stdout.take() else {
            return Err(ConnectorError::Generation("generator stdout unavailable".to_string()));
        };
        let program = self.program.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Ok(format!("{line}\n"))).await.is_err() {
                            debug!(program = %program, "Generator output dropped by consumer");
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(ConnectorError::Generation(e.to_string()))).await;
                        return;
                    }
                }
            }

            let stderr = read_stderr(&mut child).await;
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let _ = tx
                        .send(Err(ConnectorError::Generation(format!(
                            "{program} exited with {status}: {stderr}"
                        ))))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(Err(ConnectorError::Generation(e.to_string()))).await;
                }
            }
        });

        Ok(GenerationStream::new(Box::pin(ReceiverStream::new(rx))))
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}
