//! Remote shell command execution through the transport

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use devmgr_core::prelude::*;
use devmgr_core::TaskResult;

use crate::transport::DeviceTransport;

/// Runs shell commands on a device and collects line-oriented output
pub struct ShellExecutor<T> {
    transport: Arc<T>,
}

impl<T> Clone for ShellExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: DeviceTransport + Send + Sync> ShellExecutor<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Run a whitespace-separated command line and collect every output line
    pub async fn run(&self, serial: &str, command_line: &str) -> Result<Vec<String>> {
        let (command, args) = split_command(command_line)
            .ok_or_else(|| Error::transport("empty shell command"))?;
        self.run_args(serial, &command, &args).await
    }

    /// Run `command` with pre-split arguments (for arguments containing spaces)
    pub async fn run_args(
        &self,
        serial: &str,
        command: &str,
        args: &[String],
    ) -> Result<Vec<String>> {
        let stream = self.transport.execute_shell(serial, command, args).await?;

        let mut lines = BufReader::new(stream).lines();
        let mut output = Vec::new();
        while let Some(line) = lines.next_line().await? {
            output.push(line);
        }
        Ok(output)
    }

    /// Like [`run`](Self::run) but a failure is logged and yields no lines
    pub async fn run_lines(&self, serial: &str, command_line: &str) -> Vec<String> {
        match self.run(serial, command_line).await {
            Ok(lines) => lines,
            Err(e) => {
                error!("Shell command '{}' on {} failed: {}", command_line, serial, e);
                Vec::new()
            }
        }
    }

    /// Run and wrap the outcome as a [`TaskResult`]
    pub async fn run_task(&self, serial: &str, command_line: &str) -> TaskResult {
        match self.run(serial, command_line).await {
            Ok(lines) => TaskResult::success(lines),
            Err(e) => TaskResult::failure(e.to_string()),
        }
    }
}

/// Split `"ls -la /sdcard"` into `("ls", ["-la", "/sdcard"])`
pub fn split_command(command_line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command_line.split_whitespace();
    let command = parts.next()?.to_string();
    Some((command, parts.map(str::to_string).collect()))
}
