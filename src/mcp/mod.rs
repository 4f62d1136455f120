//! MCP 客户端层
//!
//! - transport: ToolServer / Connector 抽象与 ToolDescriptor
//! - remote: rmcp Streamable HTTP 实现
//! - catalog: 工具目录缓存
//! - session: SessionManager（心跳、重连、目录刷新）
//! - mock: 测试用脚本化服务器

pub mod catalog;
pub mod mock;
pub mod remote;
pub mod session;
pub mod transport;

pub use catalog::ToolCatalog;
pub use remote::{RemoteConnector, RemoteSession};
pub use session::{SessionConfig, SessionManager, SessionStatus, HEARTBEAT_TOOL};
pub use transport::{Connector, ToolDescriptor, ToolServer};
