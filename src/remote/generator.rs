use super::TextGenerator;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Runs a generator CLI: the prompt goes to stdin, the response is stdout.
pub struct CliGenerator {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CliGenerator {
    pub fn new(command: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir,
            timeout: Duration::from_secs(900),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TextGenerator for CliGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn generator command: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to generator stdin")?;
            // stdin is dropped here, closing the pipe
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for generator command")?,
            Err(_) => bail!(
                "Generator '{}' timed out after {} seconds",
                self.command,
                self.timeout.as_secs()
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Generator '{}' exited with code {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
