//! 网关配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__DISPATCH__SYNC_TIMEOUT_MS=3000`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub dispatch: DispatchSection,
    pub routing: RoutingSection,
    pub flow: FlowSection,
    pub callback: CallbackSection,
    pub agent: AgentSection,
    pub store: StoreSection,
}

/// [server] 段：监听地址与入站并发上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// 同时处理的入站请求数（快速路径的同步等待也计入）
    pub max_in_flight: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            max_in_flight: 256,
        }
    }
}

/// [logging] 段：默认日志级别与输出格式（plain / json）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// [dispatch] 段：快速路径超时、后台并发、队列深度、作业保留时长
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// 快速路径同步等待上限（毫秒），超时后转入后台
    pub sync_timeout_ms: u64,
    pub max_concurrent_jobs: usize,
    /// 待执行队列深度，满了以后拒绝新的后台作业
    pub queue_depth: usize,
    pub job_retention_secs: u64,
    pub janitor_interval_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 8_000,
            max_concurrent_jobs: 16,
            queue_depth: 1024,
            job_retention_secs: 24 * 3600,
            janitor_interval_secs: 300,
        }
    }
}

/// [routing] 段：auto 模式的启发式规则（按固定优先级匹配）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// 只读后缀 → Agent
    pub read_only_suffixes: Vec<String>,
    /// 本地快速命名空间 → Agent
    pub local_namespaces: Vec<String>,
    /// 需要多系统协作或外部挂载的命名空间 → Flow
    pub coordinated_namespaces: Vec<String>,
    /// 直接访问基础设施的命名空间 → Agent
    pub direct_namespaces: Vec<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            read_only_suffixes: vec![".peek".into(), ".read".into()],
            local_namespaces: vec!["memory.".into()],
            coordinated_namespaces: vec![
                "gmail.".into(),
                "digest.".into(),
                "workflow.".into(),
                "fs.".into(),
            ],
            direct_namespaces: vec!["ssh.".into()],
        }
    }
}

/// [flow] 段：工作流引擎 Webhook 地址与 intent 路由表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowSection {
    pub webhook_base: String,
    pub timeout_secs: u64,
    /// intent → 路径（相对 webhook_base）或完整 URL
    pub routes: HashMap<String, String>,
    /// 无专门映射时使用的兜底路径
    pub fallback_path: String,
}

impl Default for FlowSection {
    fn default() -> Self {
        let routes = [
            ("gmail.triage", "gmail-triage"),
            ("gmail.send", "gmail-send"),
            ("digest.daily", "digest-daily"),
            ("memory.search", "memory-search"),
            ("fs.analyze", "fs-analyze"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            webhook_base: "http://n8n:5678/webhook".to_string(),
            timeout_secs: 120,
            routes,
            fallback_path: "orchestrate".to_string(),
        }
    }
}

/// [callback] 段：回调超时与 HMAC 签名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbackSection {
    pub timeout_secs: u64,
    /// 未设置时不签名出站回调，也不校验入站回调
    pub hmac_secret: Option<String>,
    pub signature_header: String,
}

impl Default for CallbackSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            hmac_secret: None,
            signature_header: "X-Signature".to_string(),
        }
    }
}

/// [agent] 段：本地工具的安全闸门与 SSH 白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 破坏性 intent 执行前 inputs 中必须为 true 的字段
    pub confirm_flag: String,
    pub destructive_intents: Vec<String>,
    pub ssh_allowed_hosts: Vec<String>,
    pub ssh_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            confirm_flag: "confirm_dangerous".to_string(),
            destructive_intents: vec!["ssh.exec".into(), "ssh.run".into()],
            ssh_allowed_hosts: vec!["localhost".into(), "127.0.0.1".into()],
            ssh_timeout_secs: 30,
        }
    }
}

/// [store] 段：作业存储后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: PathBuf::from("data/hive.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_design_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.dispatch.sync_timeout_ms, 8_000);
        assert_eq!(cfg.callback.timeout_secs, 15);
        assert_eq!(cfg.flow.timeout_secs, 120);
        assert_eq!(cfg.routing.read_only_suffixes, vec![".peek", ".read"]);
        assert_eq!(cfg.flow.routes.get("gmail.triage").map(String::as_str), Some("gmail-triage"));
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[dispatch]
sync_timeout_ms = 250
queue_depth = 4

[logging]
format = "json"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.dispatch.sync_timeout_ms, 250);
        assert_eq!(cfg.dispatch.queue_depth, 4);
        // 未出现的字段保留默认值
        assert_eq!(cfg.dispatch.max_concurrent_jobs, 16);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }
}
