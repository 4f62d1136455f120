//! 客户端集成测试：mock 工具服务器 + mock LLM，经由 ProjectWiseClient 走完整请求路径

use std::sync::Arc;
use std::time::Duration;

use projectwise::config::AppConfig;
use projectwise::core::PIPELINE_TIMEOUT_MESSAGE;
use projectwise::llm::{AssistantTurn, MockLlmClient, TokenUsage};
use projectwise::mcp::mock::{MockConnector, MockToolServer};
use projectwise::memory::{InMemoryStore, ToolCallRequest};
use projectwise::react::TURN_BUDGET_MESSAGE;
use projectwise::workflow::{
    GENERATE_PROPOSAL_DOCX, GET_TEMPLATE_PLACEHOLDERS, PLACEHOLDERS_INCOMPLETE_MESSAGE,
    READ_PROJECT_MARKDOWN,
};
use projectwise::ProjectWiseClient;
use serde_json::Map;

const DOCGEN_ROUTE: &str = r#"{"intent":"generate_document","confidence_score":0.95}"#;
const OTHER_ROUTE: &str = r#"{"intent":"other","confidence_score":0.9}"#;

fn call(id: &str, name: &str, args: &str) -> AssistantTurn {
    AssistantTurn::with_tool_calls(vec![ToolCallRequest::new(id, name, args)])
}

fn docgen_server() -> Arc<MockToolServer> {
    let server = Arc::new(MockToolServer::with_default_tools());
    server.set_default("list_kak_files", r#"["KAK_VSAT_BRI.md","KAK_Internet_Pertamina.md"]"#);
    server.set_default(READ_PROJECT_MARKDOWN, r#"{"status":"success","text":"isi KAK"}"#);
    server.set_default(GET_TEMPLATE_PLACEHOLDERS, r#"{"placeholders":["judul","ruang_lingkup"]}"#);
    server.set_default(GENERATE_PROPOSAL_DOCX, r#"{"status":"success","path":"/out.docx"}"#);
    server
}

fn client(cfg: &AppConfig, server: Arc<MockToolServer>, llm: Arc<MockLlmClient>) -> (ProjectWiseClient, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::new(server));
    let client = ProjectWiseClient::new(cfg, connector.clone(), llm, Arc::new(InMemoryStore::new(100)));
    (client, connector)
}

#[tokio::test]
async fn test_docgen_happy_path() {
    let server = docgen_server();
    let llm = Arc::new(MockLlmClient::new());
    llm.push_structured(Ok(DOCGEN_ROUTE.into()));
    llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
        .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
        .push_turn(AssistantTurn::text(r#"{"judul":"VSAT","ruang_lingkup":"50 site"}"#))
        .push_turn(call(
            "c3",
            GENERATE_PROPOSAL_DOCX,
            r#"{"context":{"judul":"VSAT","ruang_lingkup":"50 site"}}"#,
        ))
        .push_turn(AssistantTurn::text("Selesai."));
    let (client, _) = client(&AppConfig::default(), server.clone(), llm);
    assert!(client.connect().await);

    let reply = client
        .process_query("Buatkan proposal untuk proyek 'VSAT BRI'", "u1", None)
        .await;
    assert!(reply.contains("Proposal berhasil dibuat untuk proyek"));
    assert!(reply.contains("/out.docx"));

    // 项目名来自 KAK 文件匹配，去掉扩展名后传给 read_project_markdown
    let read = server
        .calls()
        .into_iter()
        .find(|(name, _)| name == READ_PROJECT_MARKDOWN)
        .map(|(_, args)| args);
    assert_eq!(read.and_then(|a| a.get("project_name").cloned()), Some("KAK_VSAT_BRI".into()));
    client.cleanup().await;
}

#[tokio::test]
async fn test_docgen_incomplete_context_twice() {
    let server = docgen_server();
    let llm = Arc::new(MockLlmClient::new());
    llm.push_structured(Ok(DOCGEN_ROUTE.into()));
    llm.push_turn(call("c1", READ_PROJECT_MARKDOWN, "{}"))
        .push_turn(call("c2", GET_TEMPLATE_PLACEHOLDERS, "{}"))
        .push_turn(AssistantTurn::text(r#"{"judul":"VSAT"}"#))
        .push_turn(AssistantTurn::text(r#"{"judul":"VSAT"}"#));
    let (client, _) = client(&AppConfig::default(), server.clone(), llm);

    let reply = client.process_query("buat proposal proyek VSAT BRI", "u1", None).await;
    assert_eq!(reply, PLACEHOLDERS_INCOMPLETE_MESSAGE);
    assert_eq!(server.calls_to(GENERATE_PROPOSAL_DOCX), 0);
    client.cleanup().await;
}

#[tokio::test]
async fn test_orchestrator_turn_budget() {
    let server = Arc::new(MockToolServer::with_default_tools());
    server.set_default("websearch", "hasil pencarian");
    let llm = Arc::new(MockLlmClient::new());
    llm.push_structured(Ok(OTHER_ROUTE.into()));
    llm.set_fallback(call("c", "websearch", r#"{"query":"harga switch"}"#));
    let (client, _) = client(&AppConfig::default(), server.clone(), llm.clone());

    let reply = client.process_query("berapa harga switch core?", "u1", Some(3)).await;
    assert_eq!(reply, TURN_BUDGET_MESSAGE);
    assert_eq!(server.calls_to("websearch"), 3);
    client.cleanup().await;
}

#[tokio::test]
async fn test_router_failure_falls_back_to_orchestrator() {
    let server = Arc::new(MockToolServer::with_default_tools());
    let llm = Arc::new(MockLlmClient::new());
    llm.push_structured(Ok(DOCGEN_ROUTE.replace("0.95", "0.4")));
    llm.push_turn(AssistantTurn::text("Halo, ada yang bisa dibantu?"));
    let (client, _) = client(&AppConfig::default(), server.clone(), llm);

    let reply = client.process_query("buat proposal?", "u1", None).await;
    assert_eq!(reply, "Halo, ada yang bisa dibantu?");
    assert_eq!(server.calls_to(READ_PROJECT_MARKDOWN), 0);
    client.cleanup().await;
}

#[tokio::test]
async fn test_manual_disconnect_fails_fast() {
    let server = Arc::new(MockToolServer::with_default_tools());
    let (client, connector) = client(&AppConfig::default(), server, Arc::new(MockLlmClient::new()));
    assert!(client.connect_manual().await);
    let attempts = connector.attempts();

    client.disconnect_manual().await;
    let status = client.status().await;
    assert!(!status.connected);
    assert!(!status.auto_reconnect);

    let result = client.session().call_tool("websearch", Map::new()).await;
    assert!(result.is_err());
    assert_eq!(connector.attempts(), attempts);

    assert!(client.connect_manual().await);
    assert!(client.status().await.connected);
    client.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_timeout_message() {
    let server = docgen_server();
    server.set_delay(READ_PROJECT_MARKDOWN, Duration::from_secs(20));
    let llm = Arc::new(MockLlmClient::new());
    llm.push_structured(Ok(DOCGEN_ROUTE.into()));
    llm.set_fallback(call("c", READ_PROJECT_MARKDOWN, "{}"));

    let mut cfg = AppConfig::default();
    cfg.tools.pipeline_timeout_secs = 10;
    let (client, _) = client(&cfg, server, llm);

    let reply = client.process_query("buat proposal proyek VSAT BRI", "u1", None).await;
    assert_eq!(reply, PIPELINE_TIMEOUT_MESSAGE);
    client.cleanup().await;
}

#[tokio::test]
async fn test_docgen_respects_turn_override() {
    let server = docgen_server();
    let llm = Arc::new(MockLlmClient::new());
    llm.push_structured(Ok(DOCGEN_ROUTE.into()));
    llm.set_fallback(AssistantTurn::text("hmm"));
    let (client, _) = client(&AppConfig::default(), server, llm.clone());

    let reply = client.process_query("buat proposal proyek VSAT BRI", "u1", Some(2)).await;
    assert_eq!(reply, "Workflow berhenti: mencapai batas maksimum iterasi.");
    // 一次意图识别 + 两轮流水线
    assert_eq!(llm.request_count(), 3);
    client.cleanup().await;
}

#[tokio::test]
async fn test_token_usage_accumulates_per_client() {
    let server = Arc::new(MockToolServer::with_default_tools());
    let llm = Arc::new(MockLlmClient::new());
    llm.set_usage_per_request(10, 2);
    llm.push_structured(Ok(OTHER_ROUTE.into()));
    llm.push_turn(AssistantTurn::text("Halo!"));
    let (client, _) = client(&AppConfig::default(), server, llm);
    assert_eq!(client.token_usage(), TokenUsage::default());

    let reply = client.process_query("halo", "u1", None).await;
    assert_eq!(reply, "Halo!");
    assert_eq!(client.token_usage(), TokenUsage::new(20, 4));
    assert_eq!(client.token_usage().total, 24);
    client.cleanup().await;
}
