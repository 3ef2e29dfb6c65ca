use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use super::base::{Config, ConfigError};

/// How the engine reaches one tool backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendTransport {
    /// JSON-RPC 2.0 over HTTP POST.
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// JSON-RPC 2.0 over the stdio of a freshly spawned process.
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Tavily's REST search API.
    Tavily {
        #[serde(default = "default_tavily_url")]
        base_url: String,
    },
    /// Perplexity's REST search API.
    Perplexity {
        #[serde(default = "default_perplexity_url")]
        base_url: String,
    },
}

fn default_tavily_url() -> String {
    vsa_mcp_client::tavily::DEFAULT_BASE_URL.to_string()
}

fn default_perplexity_url() -> String {
    vsa_mcp_client::perplexity::DEFAULT_BASE_URL.to_string()
}

/// Extra handling for a backend's successful results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultHook {
    /// The result describes a rendered diagram: summarise its message and
    /// path, and place the image on the canvas.
    DiagramCanvas,
}

/// Registry entry for one backend. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub name: String,
    /// Tool names starting with this prefix are routed here.
    pub prefix: String,
    pub transport: BackendTransport,
    /// Arguments filled in when the model leaves them out.
    #[serde(default)]
    pub defaults: Map<String, Value>,
    /// Model-facing tool name to backend tool name.
    #[serde(default)]
    pub tool_names: HashMap<String, String>,
    /// Results from informational backends are followed by a request to
    /// continue the response.
    #[serde(default)]
    pub informational: bool,
    /// Heading placed above the summarised result; `{tool}` expands to the tool name.
    #[serde(default)]
    pub summary_heading: Option<String>,
    /// Secret key holding an API key for this backend.
    #[serde(default)]
    pub api_key_secret: Option<String>,
    #[serde(default)]
    pub result_hook: Option<ResultHook>,
}

/// The backends a stock deployment talks to.
pub fn default_backends() -> Vec<BackendSettings> {
    let map = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    };
    let defaults = |value: Value| match value {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    vec![
        BackendSettings {
            name: "aws-knowledge".to_string(),
            prefix: "aws_knowledge".to_string(),
            transport: BackendTransport::Remote {
                url: "https://knowledge-mcp.global.api.aws".to_string(),
                headers: HashMap::new(),
            },
            defaults: Map::new(),
            tool_names: map(&[
                ("aws_knowledge_search", "aws___search_documentation"),
                ("aws_knowledge_read", "aws___read_documentation"),
                ("aws_knowledge_recommend", "aws___recommend"),
            ]),
            informational: true,
            summary_heading: Some("AWS Knowledge snippet:".to_string()),
            api_key_secret: None,
            result_hook: None,
        },
        BackendSettings {
            name: "tavily".to_string(),
            prefix: "tavily_".to_string(),
            transport: BackendTransport::Tavily {
                base_url: default_tavily_url(),
            },
            defaults: defaults(json!({
                "max_results": 4,
                "include_answer": "basic",
                "include_raw_content": false,
                "search_depth": "basic"
            })),
            tool_names: HashMap::new(),
            informational: true,
            summary_heading: Some("Tavily {tool} results:".to_string()),
            api_key_secret: Some("tavily_api_key".to_string()),
            result_hook: None,
        },
        BackendSettings {
            name: "perplexity".to_string(),
            prefix: "perplexity_".to_string(),
            transport: BackendTransport::Perplexity {
                base_url: default_perplexity_url(),
            },
            defaults: defaults(json!({
                "max_results": 5,
                "max_tokens_per_page": 1024
            })),
            tool_names: HashMap::new(),
            informational: true,
            summary_heading: Some("Perplexity search results:".to_string()),
            api_key_secret: Some("perplexity_api_key".to_string()),
            result_hook: None,
        },
        BackendSettings {
            name: "aws-diagram".to_string(),
            prefix: "aws_".to_string(),
            transport: BackendTransport::Local {
                command: "uvx".to_string(),
                args: vec!["awslabs.aws-diagram-mcp-server".to_string()],
                env: map(&[("NO_COLOR", "1"), ("FASTMCP_LOG_LEVEL", "ERROR")]),
            },
            defaults: Map::new(),
            tool_names: map(&[
                ("aws_generate_diagram", "generate_diagram"),
                ("aws_list_diagram_icons", "list_icons"),
                ("aws_get_diagram_examples", "get_diagram_examples"),
            ]),
            informational: false,
            summary_heading: None,
            api_key_secret: None,
            result_hook: Some(ResultHook::DiagramCanvas),
        },
    ]
}

/// Tunables for a realtime session and its tool plumbing.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeSettings {
    pub session_name: String,
    pub ice_gathering_timeout: Duration,
    pub tool_result_max_chars: usize,
    pub tool_error_max_chars: usize,
    pub resume_excerpt_chars: usize,
    pub stdio_request_timeout: Duration,
    pub stdio_kill_grace: Duration,
    pub internal_command_prefixes: Vec<String>,
    pub backends: Vec<BackendSettings>,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            session_name: "primary-session".to_string(),
            ice_gathering_timeout: Duration::from_millis(3000),
            tool_result_max_chars: 4000,
            tool_error_max_chars: 400,
            resume_excerpt_chars: 800,
            stdio_request_timeout: Duration::from_secs(30),
            stdio_kill_grace: Duration::from_millis(1000),
            internal_command_prefixes: vec!["canvas.".to_string()],
            backends: default_backends(),
        }
    }
}

impl RealtimeSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            session_name: config.get_param_or("session_name", defaults.session_name)?,
            ice_gathering_timeout: Duration::from_millis(config.get_param_or(
                "ice_gathering_timeout_ms",
                defaults.ice_gathering_timeout.as_millis() as u64,
            )?),
            tool_result_max_chars: config
                .get_param_or("tool_result_max_chars", defaults.tool_result_max_chars)?,
            tool_error_max_chars: config
                .get_param_or("tool_error_max_chars", defaults.tool_error_max_chars)?,
            resume_excerpt_chars: config
                .get_param_or("resume_excerpt_chars", defaults.resume_excerpt_chars)?,
            stdio_request_timeout: Duration::from_secs(config.get_param_or(
                "stdio_request_timeout_secs",
                defaults.stdio_request_timeout.as_secs(),
            )?),
            stdio_kill_grace: Duration::from_millis(config.get_param_or(
                "stdio_kill_grace_ms",
                defaults.stdio_kill_grace.as_millis() as u64,
            )?),
            internal_command_prefixes: config
                .get_param_or("internal_command_prefixes", defaults.internal_command_prefixes)?,
            backends: config.get_param_or("backends", defaults.backends)?,
        })
    }
}
