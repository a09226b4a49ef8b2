pub mod echo;
pub mod memory;
pub mod registry;
pub mod ssh;

pub use echo::EchoTool;
pub use memory::{MemoryBook, MemorySearchTool, MemoryWriteTool};
pub use registry::{Tool, ToolRegistry};
pub use ssh::{SshExecTool, SshPeekTool};

use crate::config::AgentSection;

/// 内置本地工具注册表（Agent 执行器使用）
pub fn builtin_registry(cfg: &AgentSection) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let book = MemoryBook::new();

    registry.register(EchoTool);
    registry.register(MemoryWriteTool::new(book.clone()));
    registry.register(MemorySearchTool::new(book));
    registry.register(SshExecTool::new(cfg.ssh_allowed_hosts.clone(), cfg.ssh_timeout_secs));
    registry.register(SshPeekTool::new(cfg.ssh_allowed_hosts.clone(), cfg.ssh_timeout_secs));

    registry.alias("memory.store", "memory.write");
    registry.alias("memory.query", "memory.search");
    registry.alias("ssh.run", "ssh.exec");

    tracing::debug!(intents = ?registry.intents(), "builtin tools registered");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_contents() {
        let registry = builtin_registry(&AgentSection::default());
        for intent in [
            "debug.echo",
            "memory.write",
            "memory.store",
            "memory.search",
            "memory.query",
            "ssh.exec",
            "ssh.run",
            "ssh.exec.peek",
        ] {
            assert!(registry.get(intent).is_some(), "missing {}", intent);
        }
        assert!(registry.get("ssh.run").unwrap().destructive());
    }
}
