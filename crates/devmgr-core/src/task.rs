//! Outcome of an external process or remote shell command

use serde::Serialize;

/// Captured result of one command run.
///
/// Produced by the process runner and the shell executor, consumed by the
/// operation that asked for it, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub success: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl TaskResult {
    pub fn success(stdout: Vec<String>) -> Self {
        Self {
            success: true,
            stdout,
            stderr: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: Vec::new(),
            stderr: vec![message.into()],
        }
    }

    /// Render output lines as a JSON array, the form shown in a device's status
    pub fn render(lines: &[String]) -> String {
        serde_json::to_string(lines).unwrap_or_else(|_| lines.join("\n"))
    }

    /// Status text after the run: stderr on failure, stdout on success when
    /// `show_output`, otherwise idle
    pub fn status_text(&self, show_output: bool) -> Option<String> {
        if !self.success {
            Some(Self::render(&self.stderr))
        } else if show_output {
            Some(Self::render(&self.stdout))
        } else {
            None
        }
    }
}
