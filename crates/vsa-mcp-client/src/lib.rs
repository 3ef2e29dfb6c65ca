pub mod backend;
pub mod error;
pub mod perplexity;
pub mod protocol;
pub mod service;
pub mod tavily;
pub mod transport;

pub use backend::{ToolBackend, ToolSegment};
pub use error::BackendError;
pub use perplexity::PerplexityBackend;
pub use protocol::{ClientInfo, PROTOCOL_VERSION};
pub use service::PendingRequests;
pub use tavily::TavilyBackend;
pub use transport::{HttpJsonRpcBackend, StdioBackend};
