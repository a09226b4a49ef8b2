//! 工具注册表
//!
//! 所有本地工具实现 Tool trait（name / description / execute），由 ToolRegistry 按 intent 注册与查找；
//! 同一个工具可以挂多个别名（如 memory.write 与 memory.store）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::job::Document;

/// 工具 trait：intent 名称、描述、异步执行（args 为 inputs 文档）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 注册用的 intent 名称
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 破坏性工具执行前需要调用方显式确认
    fn destructive(&self) -> bool {
        false
    }

    async fn execute(&self, args: &Document) -> Result<Document, String>;
}

/// 工具注册表：intent → Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// 为已注册的 intent 增加别名；目标不存在时返回 false
    pub fn alias(&mut self, alias: &str, target: &str) -> bool {
        match self.tools.get(target).cloned() {
            Some(tool) => {
                self.tools.insert(alias.to_string(), tool);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, intent: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(intent).cloned()
    }

    /// 已注册 intent（排序，便于错误提示）
    pub fn intents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_register_and_alias() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.get("debug.echo").is_some());
        assert!(registry.alias("debug.say", "debug.echo"));
        assert!(!registry.alias("x", "missing"));
        assert_eq!(registry.intents(), vec!["debug.echo", "debug.say"]);
        assert!(!registry.get("debug.say").unwrap().destructive());
    }
}
