//! 执行模式与 auto 模式解析
//!
//! ModeResolver 是纯函数：只看 intent 名称，按固定优先级匹配规则，第一条命中即返回，
//! 都不命中时默认 Flow（更重、可审计的路径）。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RoutingSection;
use crate::dispatch::job::Document;

/// 调用方请求的模式（可为 auto）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestedMode {
    Flow,
    #[serde(alias = "mcp")]
    Protocol,
    Agent,
    #[default]
    Auto,
}

/// 解析后的具体执行器族（作业记录里保存的就是它）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Flow,
    Protocol,
    Agent,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Flow => "flow",
            Mode::Protocol => "protocol",
            Mode::Agent => "agent",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RequestedMode {
    /// 非 auto 时的具体模式
    pub fn concrete(self) -> Option<Mode> {
        match self {
            RequestedMode::Flow => Some(Mode::Flow),
            RequestedMode::Protocol => Some(Mode::Protocol),
            RequestedMode::Agent => Some(Mode::Agent),
            RequestedMode::Auto => None,
        }
    }
}

/// auto 模式启发式规则
#[derive(Debug, Clone)]
pub struct ModeResolver {
    read_only_suffixes: Vec<String>,
    local_namespaces: Vec<String>,
    coordinated_namespaces: Vec<String>,
    direct_namespaces: Vec<String>,
}

impl Default for ModeResolver {
    fn default() -> Self {
        Self::from_config(&RoutingSection::default())
    }
}

impl ModeResolver {
    pub fn from_config(cfg: &RoutingSection) -> Self {
        Self {
            read_only_suffixes: cfg.read_only_suffixes.clone(),
            local_namespaces: cfg.local_namespaces.clone(),
            coordinated_namespaces: cfg.coordinated_namespaces.clone(),
            direct_namespaces: cfg.direct_namespaces.clone(),
        }
    }

    /// intent → 执行模式；inputs 目前不参与判断
    pub fn resolve(&self, intent: &str, _inputs: &Document) -> Mode {
        if self.is_read_only(intent) {
            return Mode::Agent;
        }
        if starts_with_any(intent, &self.local_namespaces) {
            return Mode::Agent;
        }
        if starts_with_any(intent, &self.coordinated_namespaces) {
            return Mode::Flow;
        }
        if starts_with_any(intent, &self.direct_namespaces) {
            return Mode::Agent;
        }
        Mode::Flow
    }

    /// 请求模式为 auto 时解析，否则原样返回
    pub fn resolve_requested(&self, requested: RequestedMode, intent: &str, inputs: &Document) -> Mode {
        requested
            .concrete()
            .unwrap_or_else(|| self.resolve(intent, inputs))
    }

    pub fn is_read_only(&self, intent: &str) -> bool {
        self.read_only_suffixes.iter().any(|s| intent.ends_with(s.as_str()))
    }

    /// 只读或本地命名空间的 intent 走快速路径
    pub fn is_fast_path(&self, intent: &str) -> bool {
        self.is_read_only(intent) || starts_with_any(intent, &self.local_namespaces)
    }
}

fn starts_with_any(intent: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| intent.starts_with(p.as_str()))
}
