//! 长期记忆：跨会话的对话记忆，按用户隔离并支持检索
//!
//! MemoryStore 是编排层依赖的外部协作者接口（get_memories / add_conversation）；
//! 当前内置 InMemoryStore（关键词重叠检索）与 NoopMemory，后续可接向量库实现同一 trait。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::memory::Message;

/// 长期记忆存储：检索与写入。失败以字符串返回，调用方只记录日志、不中断对话
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 按 query 检索该用户最相关的 limit 条记忆
    async fn get_memories(&self, query: &str, user_id: &str, limit: usize) -> Result<Vec<String>, String>;

    /// 写入一段对话（通常是 user + assistant 两条）
    async fn add_conversation(&self, messages: &[Message], user_id: &str) -> Result<(), String>;
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Debug, Default)]
pub struct NoopMemory;

#[async_trait]
impl MemoryStore for NoopMemory {
    async fn get_memories(&self, _query: &str, _user_id: &str, _limit: usize) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }

    async fn add_conversation(&self, _messages: &[Message], _user_id: &str) -> Result<(), String> {
        Ok(())
    }
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

type Entry = (String, HashSet<String>);

/// 简单内存实现：每个用户一份记忆列表，按关键词重叠检索，超出 max_entries 时丢弃最旧条目
pub struct InMemoryStore {
    store: RwLock<HashMap<String, Vec<Entry>>>,
    max_entries: usize,
}

impl InMemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// 某用户当前记忆条数
    pub fn len_for(&self, user_id: &str) -> usize {
        self.store
            .read()
            .map(|s| s.get(user_id).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(2000)
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get_memories(&self, query: &str, user_id: &str, limit: usize) -> Result<Vec<String>, String> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let store = self.store.read().map_err(|e| e.to_string())?;
        let Some(entries) = store.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(usize, usize, &str)> = entries
            .iter()
            .enumerate()
            .map(|(idx, (text, tokens))| (query_tokens.intersection(tokens).count(), idx, text.as_str()))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        // 分数相同时较新的优先
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, text)| text.to_string())
            .collect())
    }

    async fn add_conversation(&self, messages: &[Message], user_id: &str) -> Result<(), String> {
        let mut store = self.store.write().map_err(|e| e.to_string())?;
        let entries = store.entry(user_id.to_string()).or_default();
        for msg in messages {
            let text = msg.content.trim();
            if text.is_empty() {
                continue;
            }
            let line = format!("{}: {}", msg.role.as_str(), text);
            let tokens = tokenize_lower(text);
            entries.push((line, tokens));
        }
        let n = entries.len();
        if n > self.max_entries {
            entries.drain(0..n - self.max_entries);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_search_by_overlap() {
        let store = InMemoryStore::new(10);
        store
            .add_conversation(
                &[
                    Message::user("harga internet dedicated 100 mbps"),
                    Message::assistant("Harga ND = Rp. 10.000.000"),
                ],
                "u1",
            )
            .await
            .unwrap();

        let hits = store.get_memories("berapa harga internet", "u1", 5).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].contains("internet"));
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let store = InMemoryStore::new(10);
        store
            .add_conversation(&[Message::user("proyek switch core")], "alice")
            .await
            .unwrap();
        let hits = store.get_memories("switch core", "bob", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_max_entries_drops_oldest() {
        let store = InMemoryStore::new(2);
        for i in 0..4 {
            store
                .add_conversation(&[Message::user(format!("catatan nomor{i}"))], "u")
                .await
                .unwrap();
        }
        assert_eq!(store.len_for("u"), 2);
        let hits = store.get_memories("nomor0", "u", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_noop_memory() {
        let store = NoopMemory;
        store.add_conversation(&[Message::user("x")], "u").await.unwrap();
        assert!(store.get_memories("x", "u", 5).await.unwrap().is_empty());
    }
}
