//! Shell command execution utilities.
//!
//! Every external process the reconciler starts goes through this module:
//! commands are run through `/bin/sh -c`, arguments are quoted with
//! [`shellquote`], and each call can be bounded by a timeout so a hung tool
//! cannot block the run forever.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use vfd_common::shell::{self, LSPCI_CMD, shellquote};
//!
//! let cmd = format!("{} -k -s {}", LSPCI_CMD, shellquote("0000:01:00.0"));
//! let result = shell::exec_timeout(&cmd, Some(Duration::from_secs(30))).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{VfdError, VfdResult};

/// Path to `lspci` for driver attachment reports.
pub const LSPCI_CMD: &str = "/usr/bin/lspci";

/// Path to `lsmod` for loaded module queries.
pub const LSMOD_CMD: &str = "/sbin/lsmod";

/// Path to `modprobe` for loading kernel modules.
pub const MODPROBE_CMD: &str = "/sbin/modprobe";

/// Path to `rmmod` for unloading kernel modules.
pub const RMMOD_CMD: &str = "/sbin/rmmod";

/// Default path to the DPDK device bind tool.
pub const DPDK_DEVBIND_CMD: &str = "/usr/bin/dpdk-devbind";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\`
/// and newline.
///
/// # Example
///
/// ```
/// use vfd_common::shell::shellquote;
///
/// assert_eq!(shellquote("0000:01:00.0"), "\"0000:01:00.0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The trimmed stdout output.
    pub stdout: String,
    /// The trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command, killing it if it runs longer than `timeout`.
///
/// Non-zero exit codes are returned in the [`ExecResult`]; only spawn
/// failures and timeouts are errors.
pub async fn exec_timeout(cmd: &str, timeout: Option<Duration>) -> VfdResult<ExecResult> {
    tracing::debug!(command = %cmd, timeout = ?timeout, "Executing shell command");

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child)
            .await
            .map_err(|_| VfdError::Timeout {
                command: cmd.to_string(),
                timeout: limit,
            })?,
        None => child.await,
    }
    .map_err(|e| VfdError::ShellExec {
        command: cmd.to_string(),
        source: e,
    })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let result = ExecResult {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
pub async fn exec_or_throw(cmd: &str, timeout: Option<Duration>) -> VfdResult<String> {
    let result = exec_timeout(cmd, timeout).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(VfdError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
