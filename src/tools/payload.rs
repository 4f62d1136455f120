//! 工具结果载荷
//!
//! 远程工具返回文本；JSON 对象解析为 Structured，其它内容保留为 Raw。
//! 文档生成步骤允许服务端直接返回文件路径字符串，此时按 `{"status":"success","path":...}` 处理。

use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    Structured(Map<String, Value>),
    Raw(String),
}

impl ToolPayload {
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => ToolPayload::Structured(map),
            _ => ToolPayload::Raw(raw.to_string()),
        }
    }

    /// 文档生成结果：非 JSON 对象的文本视为成功生成的文件路径
    pub fn parse_generated_path(raw: &str) -> Self {
        match Self::parse(raw) {
            ToolPayload::Raw(text) if serde_json::from_str::<Value>(&text).is_err() => {
                let mut map = Map::new();
                map.insert("status".into(), Value::String("success".into()));
                map.insert("path".into(), Value::String(text.trim().to_string()));
                ToolPayload::Structured(map)
            }
            other => other,
        }
    }

    /// 工具调用失败时的统一信封
    pub fn failure(error: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("status".into(), Value::String("failure".into()));
        map.insert("error".into(), Value::String(error.into()));
        ToolPayload::Structured(map)
    }

    fn field(&self, key: &str) -> Option<&str> {
        match self {
            ToolPayload::Structured(map) => map.get(key).and_then(Value::as_str),
            ToolPayload::Raw(_) => None,
        }
    }

    pub fn status(&self) -> Option<&str> {
        match self {
            ToolPayload::Structured(_) => self.field("status"),
            ToolPayload::Raw(_) => Some("raw"),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == Some("success")
    }

    /// 显式报告失败（status 为 failure / error）
    pub fn is_failure(&self) -> bool {
        matches!(self.status(), Some("failure") | Some("error"))
    }

    pub fn error(&self) -> Option<&str> {
        self.field("error")
    }

    pub fn text(&self) -> Option<&str> {
        self.field("text")
    }

    pub fn path(&self) -> Option<&str> {
        self.field("path")
    }

    /// 占位符列表：`["a","b"]` 或 `{"placeholders":["a","b"]}`；非字符串元素忽略
    pub fn placeholders(&self) -> Option<Vec<String>> {
        let list = match self {
            ToolPayload::Structured(map) => map.get("placeholders").cloned(),
            ToolPayload::Raw(raw) => serde_json::from_str::<Value>(raw).ok(),
        };
        match list {
            Some(Value::Array(items)) => Some(
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ToolPayload::Structured(map) => Value::Object(map.clone()),
            ToolPayload::Raw(raw) => json!({ "status": "raw", "data": raw }),
        }
    }
}
