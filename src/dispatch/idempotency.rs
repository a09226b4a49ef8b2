//! 幂等缓存
//!
//! 指纹 = SHA-256(规范化 JSON {"intent", "inputs"})，对象键按字典序输出，
//! 与 map 迭代顺序无关。调用方给出的 idempotency_key 原样使用。
//! record 基于存储的 insert_if_absent，同一指纹的并发请求只会建出一个作业。

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::StoreError;
use crate::dispatch::job::{Document, Job};
use crate::dispatch::store::{Claim, JobStore};

/// 幂等缓存：包装 JobStore 的键索引
#[derive(Clone)]
pub struct IdempotencyCache {
    store: Arc<dyn JobStore>,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// supplied 存在（且非空）时原样使用，否则由 intent + inputs 计算指纹
    pub fn key_for(intent: &str, inputs: &Document, supplied: Option<&str>) -> String {
        if let Some(key) = supplied.filter(|k| !k.is_empty()) {
            return key.to_string();
        }
        fingerprint(intent, inputs)
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<Job>, StoreError> {
        self.store.find_by_key(key).await
    }

    /// 原子的「查键 + 写入」：返回本次新建的作业，或已占用该键的作业
    pub async fn record(&self, job: Job) -> Result<Claim, StoreError> {
        self.store.insert_if_absent(job).await
    }

    /// 撤销占位（快速路径上直接回给调用方的错误不留作业）
    pub async fn forget(&self, key: &str, job_id: &str) -> Result<(), StoreError> {
        self.store.release(key, job_id).await
    }
}

pub fn fingerprint(intent: &str, inputs: &Document) -> String {
    let mut canonical = String::new();
    canonical.push_str("{\"inputs\":");
    write_canonical(&Value::Object(inputs.clone()), &mut canonical);
    canonical.push_str(",\"intent\":");
    write_canonical(&Value::String(intent.to_string()), &mut canonical);
    canonical.push('}');
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// 规范化 JSON：对象键排序，无多余空白
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::job::Trace;
    use crate::dispatch::mode::Mode;
    use crate::dispatch::store::MemoryJobStore;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let mut a = Document::new();
        a.insert("text".into(), json!("hello"));
        a.insert("tags".into(), json!(["x", "y"]));
        a.insert("meta".into(), json!({"b": 1, "a": 2}));

        let mut b = Document::new();
        b.insert("meta".into(), json!({"a": 2, "b": 1}));
        b.insert("tags".into(), json!(["x", "y"]));
        b.insert("text".into(), json!("hello"));

        assert_eq!(fingerprint("memory.write", &a), fingerprint("memory.write", &b));
        assert_eq!(fingerprint("memory.write", &a).len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_intent_and_inputs() {
        let inputs = doc(json!({"query": "paris"}));
        assert_ne!(fingerprint("memory.search", &inputs), fingerprint("memory.query", &inputs));
        assert_ne!(
            fingerprint("memory.search", &inputs),
            fingerprint("memory.search", &doc(json!({"query": "rome"})))
        );
        // 数组顺序有意义
        assert_ne!(
            fingerprint("x", &doc(json!({"v": [1, 2]}))),
            fingerprint("x", &doc(json!({"v": [2, 1]})))
        );
    }

    #[test]
    fn test_supplied_key_is_used_verbatim() {
        let inputs = doc(json!({"query": "paris"}));
        assert_eq!(IdempotencyCache::key_for("memory.search", &inputs, Some("abc")), "abc");
        assert_eq!(
            IdempotencyCache::key_for("memory.search", &inputs, Some("")),
            fingerprint("memory.search", &inputs)
        );
    }

    #[tokio::test]
    async fn test_record_then_lookup() {
        let cache = IdempotencyCache::new(Arc::new(MemoryJobStore::new()));
        let job = Job::new("memory.write", Mode::Agent, Document::new(), "k1", None, Trace::new());
        let id = job.id().to_string();

        assert!(cache.lookup("k1").await.unwrap().is_none());
        assert!(matches!(cache.record(job).await.unwrap(), Claim::Created(_)));
        assert_eq!(cache.lookup("k1").await.unwrap().unwrap().id(), id);

        cache.forget("k1", &id).await.unwrap();
        assert!(cache.lookup("k1").await.unwrap().is_none());
    }
}
