//! 记忆工具：memory.write / memory.search
//!
//! 进程内笔记本，按词命中率打分检索；向量检索等真实后端不在网关范围内。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::dispatch::job::Document;
use crate::tools::Tool;

#[derive(Debug, Clone, Serialize)]
struct Note {
    item_id: String,
    text: String,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speaker_id: Option<String>,
    created_at: i64,
}

/// 共享笔记本（写入与检索工具共用）
#[derive(Clone, Default)]
pub struct MemoryBook {
    notes: Arc<RwLock<Vec<Note>>>,
}

impl MemoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.notes.read().await.len()
    }
}

fn string_list(args: &Document, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn required_str<'a>(args: &'a Document, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("Missing required argument: {}", key))
}

/// memory.write：写入一条笔记
pub struct MemoryWriteTool {
    book: MemoryBook,
}

impl MemoryWriteTool {
    pub fn new(book: MemoryBook) -> Self {
        Self { book }
    }
}

#[async_trait]
impl Tool for MemoryWriteTool {
    fn name(&self) -> &str {
        "memory.write"
    }

    fn description(&self) -> &str {
        "Store a memory item. Args: {\"text\": \"...\", \"tags\": [..], \"speaker_id\": \"...\"}"
    }

    async fn execute(&self, args: &Document) -> Result<Document, String> {
        let text = required_str(args, "text")?.to_string();
        let note = Note {
            item_id: format!("mem_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            tags: string_list(args, "tags"),
            speaker_id: args.get("speaker_id").and_then(Value::as_str).map(str::to_string),
            created_at: chrono::Utc::now().timestamp_millis(),
            text,
        };

        let out = json!({
            "item_id": note.item_id,
            "status": "stored",
            "text_length": note.text.chars().count(),
            "tags": note.tags,
        });
        self.book.notes.write().await.push(note);
        Ok(out.as_object().cloned().unwrap_or_default())
    }
}

/// memory.search：按查询词命中率检索
pub struct MemorySearchTool {
    book: MemoryBook,
}

impl MemorySearchTool {
    pub fn new(book: MemoryBook) -> Self {
        Self { book }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory.search"
    }

    fn description(&self) -> &str {
        "Search stored memory. Args: {\"query\": \"...\", \"k\": 5, \"tags\": [..]}"
    }

    async fn execute(&self, args: &Document) -> Result<Document, String> {
        let query = required_str(args, "query")?;
        let k = args.get("k").and_then(Value::as_u64).unwrap_or(5).max(1) as usize;
        let tag_filter = string_list(args, "tags");
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();

        let notes = self.book.notes.read().await;
        let mut scored: Vec<(f64, &Note)> = notes
            .iter()
            .filter(|n| tag_filter.iter().all(|t| n.tags.contains(t)))
            .filter_map(|n| {
                let text = n.text.to_lowercase();
                let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
                (hits > 0).then(|| (hits as f64 / terms.len() as f64, n))
            })
            .collect();
        // 分数高的在前，同分时新的在前
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.created_at.cmp(&a.1.created_at))
        });
        scored.truncate(k);

        let results: Vec<Value> = scored
            .iter()
            .map(|(score, note)| {
                json!({
                    "item_id": note.item_id,
                    "text": note.text,
                    "tags": note.tags,
                    "score": score,
                })
            })
            .collect();

        let out = json!({
            "query": query,
            "count": results.len(),
            "results": results,
        });
        Ok(out.as_object().cloned().unwrap_or_default())
    }
}
