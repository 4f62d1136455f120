//! 意图识别
//!
//! IntentRouter 用结构化输出把用户查询分到 generate_document / other 两类，并给出置信度。
//! 失败（请求错误、输出无法解析）按 RetryPolicy 退避重试，全部失败时返回 {other, 0.0}，从不中断查询处理。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{LlmError, RetryPolicy};
use crate::llm::LlmClient;
use crate::memory::Message;

/// 置信度不低于该值才采用模型给出的意图
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

const SCHEMA_NAME: &str = "IntentRoute";

const ROUTER_INSTRUCTION: &str = "Anda adalah \"ProjectWise\", asisten virtual untuk tim Presales & Project Manager.\n\
Tugas Anda: menganalisis pesan user lalu memilih SATU intent:\n\
  1. generate_document - user meminta pembuatan dokumen atau proposal.\n\
  2. other             - di luar kategori di atas.\n\
Kembalikan hanya JSON valid: {\"intent\": \"<generate_document|other>\", \"confidence_score\": 0.xx}.\n\
confidence_score harus antara 0 dan 1.\n\
Kata kunci generate_document: buatkan dokumen, buat proposal, proposal teknis, proposal harga, generate document.";

const FEW_SHOT: &[(&str, &str)] = &[
    (
        "Buatkan proposal teknis untuk proyek 'Internet Dedicated Pertamina'",
        r#"{"intent":"generate_document","confidence_score":0.95}"#,
    ),
    (
        "Tolong generate document proposal harga untuk KAK Bank Sumsel Babel",
        r#"{"intent":"generate_document","confidence_score":0.92}"#,
    ),
    (
        "Apa saja file KAK yang sudah diunggah minggu ini?",
        r#"{"intent":"other","confidence_score":0.9}"#,
    ),
    (
        "Berapa SLA standar untuk layanan VSAT?",
        r#"{"intent":"other","confidence_score":0.88}"#,
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    GenerateDocument,
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::GenerateDocument => "generate_document",
            Intent::Other => "other",
        }
    }
}

/// 分类结果；confidence_score 始终位于 [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IntentRoute {
    pub intent: Intent,
    pub confidence_score: f64,
}

impl IntentRoute {
    /// 全部尝试失败时的安全默认值
    pub fn fallback() -> Self {
        Self {
            intent: Intent::Other,
            confidence_score: 0.0,
        }
    }

    /// 置信度达到阈值时采用模型的意图，否则为 Other
    pub fn accepted(&self) -> Intent {
        if self.confidence_score >= CONFIDENCE_THRESHOLD {
            self.intent
        } else {
            Intent::Other
        }
    }

    /// 解析模型输出并把分数收敛到 [0, 1]
    pub fn parse(raw: &str) -> Result<Self, LlmError> {
        let mut route: IntentRoute =
            serde_json::from_str(raw.trim()).map_err(|e| LlmError::Parse(e.to_string()))?;
        route.confidence_score = if route.confidence_score.is_nan() {
            0.0
        } else {
            route.confidence_score.clamp(0.0, 1.0)
        };
        Ok(route)
    }
}

/// 意图路由器
pub struct IntentRouter {
    llm: Arc<dyn LlmClient>,
    policy: RetryPolicy,
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn build_messages(query: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(FEW_SHOT.len() * 2 + 2);
        messages.push(Message::system(ROUTER_INSTRUCTION));
        for (user, assistant) in FEW_SHOT {
            messages.push(Message::user(*user));
            messages.push(Message::assistant(*assistant));
        }
        messages.push(Message::user(query));
        messages
    }

    async fn attempt(&self, messages: &[Message]) -> Result<IntentRoute, LlmError> {
        let schema = serde_json::to_value(schemars::schema_for!(IntentRoute))
            .map_err(|e| LlmError::Build(e.to_string()))?;
        let raw = self.llm.complete_structured(messages, SCHEMA_NAME, schema).await?;
        tracing::debug!(raw = %raw, "router output");
        IntentRoute::parse(&raw)
    }

    /// 分类查询；不会返回错误
    pub async fn classify(&self, query: &str) -> IntentRoute {
        let messages = Self::build_messages(query);
        for attempt in 0..self.policy.max_attempts {
            match self.attempt(&messages).await {
                Ok(route) => {
                    info!(
                        intent = route.intent.as_str(),
                        confidence = route.confidence_score,
                        "intent classified"
                    );
                    return route;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "classify_intent attempt failed");
                    if attempt + 1 < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
            }
        }
        warn!("Falling back to 'other'");
        IntentRoute::fallback()
    }
}
