//! SSH 工具：ssh.exec（破坏性，需确认）与 ssh.exec.peek（只读命令白名单）
//!
//! 通过系统 ssh 客户端执行（BatchMode，不交互输入密码），主机必须在白名单内，带超时与 tracing 审计。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::dispatch::job::Document;
use crate::tools::Tool;

/// ssh.exec.peek 允许的命令名（首词）
const PEEK_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "grep", "find", "ps", "top", "df", "du", "free", "uptime",
    "whoami", "hostname", "date", "pwd",
];

/// 即使首词合法也不允许出现的片段（管道、重定向、命令拼接）
const PEEK_FORBIDDEN: &[&str] = &[";", "&&", "||", "|", ">", "<", "`", "$("];

#[derive(Debug, Clone)]
struct SshTarget {
    host: String,
    user: Option<String>,
    port: u16,
    command: String,
}

/// 两个 SSH 工具共用的执行器
#[derive(Debug, Clone)]
struct SshRunner {
    allowed_hosts: HashSet<String>,
    timeout: Duration,
}

impl SshRunner {
    fn new(allowed_hosts: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            allowed_hosts: allowed_hosts.into_iter().map(|h| h.to_lowercase()).collect(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn parse(&self, args: &Document) -> Result<SshTarget, String> {
        let host = args
            .get("host")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or("Missing required argument: host")?;
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or("Missing required argument: command")?;

        if !self.allowed_hosts.contains(&host.to_lowercase()) {
            return Err(format!("Host '{}' not in allowlist", host));
        }
        // 主机名里不允许出现选项或空白，防止注入 ssh 参数
        if host.starts_with('-') || host.contains(char::is_whitespace) {
            return Err(format!("Invalid host: {}", host));
        }

        let port = match args.get("port") {
            None | Some(Value::Null) => 22,
            Some(v) => v
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .filter(|p| *p > 0)
                .ok_or("Invalid port")?,
        };

        Ok(SshTarget {
            host: host.to_string(),
            user: args.get("user").and_then(Value::as_str).map(str::to_string),
            port,
            command: command.to_string(),
        })
    }

    async fn run(&self, target: &SshTarget) -> Result<Document, String> {
        let destination = match &target.user {
            Some(user) => format!("{}@{}", user, target.host),
            None => target.host.clone(),
        };
        tracing::info!(host = %target.host, command = %target.command, "ssh tool execute");

        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", "-p"])
            .arg(target.port.to_string())
            .arg(&destination)
            .arg(&target.command)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("Execution failed: {}", e))?;

        let out = json!({
            "host": target.host,
            "command": target.command,
            "exit_code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        });
        if !output.status.success() {
            return Err(format!(
                "Exit {:?}\nstderr: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(out.as_object().cloned().unwrap_or_default())
    }
}

/// ssh.exec：在白名单主机上执行任意命令
pub struct SshExecTool {
    runner: SshRunner,
}

impl SshExecTool {
    pub fn new(allowed_hosts: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            runner: SshRunner::new(allowed_hosts, timeout_secs),
        }
    }
}

#[async_trait]
impl Tool for SshExecTool {
    fn name(&self) -> &str {
        "ssh.exec"
    }

    fn description(&self) -> &str {
        "Run a command on an allowlisted host over SSH. Requires confirmation."
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, args: &Document) -> Result<Document, String> {
        let target = self.runner.parse(args)?;
        self.runner.run(&target).await
    }
}

/// ssh.exec.peek：只读命令
pub struct SshPeekTool {
    runner: SshRunner,
}

impl SshPeekTool {
    pub fn new(allowed_hosts: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            runner: SshRunner::new(allowed_hosts, timeout_secs),
        }
    }

    fn check_read_only(command: &str) -> Result<(), String> {
        if let Some(bad) = PEEK_FORBIDDEN.iter().find(|p| command.contains(*p)) {
            return Err(format!("Forbidden pattern: {}", bad));
        }
        let name = command.split_whitespace().next().unwrap_or("");
        if PEEK_COMMANDS.contains(&name) {
            Ok(())
        } else {
            Err(format!("Command '{}' is not read-only", name))
        }
    }
}

#[async_trait]
impl Tool for SshPeekTool {
    fn name(&self) -> &str {
        "ssh.exec.peek"
    }

    fn description(&self) -> &str {
        "Run a read-only command (ls, cat, df, ps, ...) on an allowlisted host over SSH."
    }

    async fn execute(&self, args: &Document) -> Result<Document, String> {
        let target = self.runner.parse(args)?;
        Self::check_read_only(&target.command)?;
        self.runner.run(&target).await
    }
}
