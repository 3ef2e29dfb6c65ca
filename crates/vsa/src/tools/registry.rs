use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;
use vsa_mcp_client::transport::ToolNameMap;
use vsa_mcp_client::{
    BackendError, HttpJsonRpcBackend, PerplexityBackend, StdioBackend, TavilyBackend, ToolBackend,
};

use crate::config::{
    BackendSettings, BackendTransport, Config, ConfigError, RealtimeSettings, ResultHook,
};

/// A registered backend and the policy attached to it.
#[derive(Clone)]
pub struct BackendRoute {
    pub name: String,
    pub prefix: String,
    pub backend: Arc<dyn ToolBackend>,
    pub defaults: Map<String, Value>,
    pub informational: bool,
    pub summary_heading: Option<String>,
    pub result_hook: Option<ResultHook>,
}

impl BackendRoute {
    pub fn new<N: Into<String>, P: Into<String>>(
        name: N,
        prefix: P,
        backend: Arc<dyn ToolBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            backend,
            defaults: Map::new(),
            informational: false,
            summary_heading: None,
            result_hook: None,
        }
    }

    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn informational(mut self, informational: bool) -> Self {
        self.informational = informational;
        self
    }

    pub fn with_summary_heading<S: Into<String>>(mut self, heading: S) -> Self {
        self.summary_heading = Some(heading.into());
        self
    }

    pub fn with_result_hook(mut self, hook: ResultHook) -> Self {
        self.result_hook = Some(hook);
        self
    }

    /// Fill in default arguments the model left out. Non-object arguments are
    /// passed through untouched.
    pub fn enrich(&self, arguments: Value) -> Value {
        match arguments {
            Value::Object(mut map) => {
                for (key, value) in &self.defaults {
                    if !map.contains_key(key) {
                        map.insert(key.clone(), value.clone());
                    }
                }
                Value::Object(map)
            }
            other => other,
        }
    }

    pub fn heading_for(&self, tool: &str) -> Option<String> {
        self.summary_heading
            .as_ref()
            .map(|heading| heading.replace("{tool}", tool))
    }
}

pub enum ToolTarget<'a> {
    Internal,
    Backend(&'a BackendRoute),
    Unsupported,
}

/// Static table mapping tool names to internal commands or backends.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    internal_prefixes: Vec<String>,
    routes: Vec<BackendRoute>,
}

impl ToolRegistry {
    pub fn new(internal_prefixes: Vec<String>, routes: Vec<BackendRoute>) -> Self {
        Self {
            internal_prefixes,
            routes,
        }
    }

    /// Build the registry described by `settings`, reading API keys from `config`.
    pub fn from_settings(settings: &RealtimeSettings, config: &Config) -> Result<Self, ConfigError> {
        let routes = settings
            .backends
            .iter()
            .map(|backend| build_route(backend, settings, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(settings.internal_command_prefixes.clone(), routes))
    }

    /// Internal prefixes win; among backends the longest matching prefix wins.
    pub fn classify(&self, name: &str) -> ToolTarget<'_> {
        if self
            .internal_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
        {
            return ToolTarget::Internal;
        }

        self.routes
            .iter()
            .filter(|route| name.starts_with(route.prefix.as_str()))
            .max_by_key(|route| route.prefix.len())
            .map(ToolTarget::Backend)
            .unwrap_or(ToolTarget::Unsupported)
    }

    pub fn routes(&self) -> &[BackendRoute] {
        &self.routes
    }
}

fn api_key(settings: &BackendSettings, config: &Config) -> Result<Option<String>, ConfigError> {
    let Some(secret) = &settings.api_key_secret else {
        return Ok(None);
    };
    match config.get_secret::<String>(secret) {
        Ok(key) => Ok(Some(key)),
        Err(ConfigError::NotFound(_)) => {
            warn!(backend = %settings.name, secret = %secret, "API key not configured");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn build_route(
    settings: &BackendSettings,
    realtime: &RealtimeSettings,
    config: &Config,
) -> Result<BackendRoute, ConfigError> {
    let tool_names = ToolNameMap::new(settings.tool_names.clone());
    let key = api_key(settings, config)?;
    let to_config_error = |e: BackendError| ConfigError::DeserializeError(e.to_string());

    let backend: Arc<dyn ToolBackend> = match &settings.transport {
        BackendTransport::Remote { url, headers } => {
            let mut backend = HttpJsonRpcBackend::new(settings.name.clone(), url.clone())
                .map_err(to_config_error)?
                .with_tool_names(tool_names);
            for (name, value) in headers {
                backend = backend.with_header(name.clone(), value.clone());
            }
            if let Some(key) = key {
                backend = backend.with_header("Authorization", format!("Bearer {}", key));
            }
            Arc::new(backend)
        }
        BackendTransport::Local { command, args, env } => Arc::new(
            StdioBackend::new(settings.name.clone(), command.clone(), args.clone())
                .with_env(env.clone())
                .with_tool_names(tool_names)
                .with_request_timeout(realtime.stdio_request_timeout)
                .with_kill_grace(realtime.stdio_kill_grace),
        ),
        BackendTransport::Tavily { base_url } => Arc::new(
            TavilyBackend::new(settings.name.clone(), key.unwrap_or_default())
                .map_err(to_config_error)?
                .with_base_url(base_url.clone()),
        ),
        BackendTransport::Perplexity { base_url } => Arc::new(
            PerplexityBackend::new(settings.name.clone(), key.unwrap_or_default())
                .map_err(to_config_error)?
                .with_base_url(base_url.clone()),
        ),
    };

    let mut route = BackendRoute::new(settings.name.clone(), settings.prefix.clone(), backend)
        .with_defaults(settings.defaults.clone())
        .informational(settings.informational);
    if let Some(heading) = &settings.summary_heading {
        route = route.with_summary_heading(heading.clone());
    }
    if let Some(hook) = settings.result_hook {
        route = route.with_result_hook(hook);
    }
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use vsa_mcp_client::ToolSegment;

    struct Named(&'static str);

    #[async_trait]
    impl ToolBackend for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn call(
            &self,
            _tool: &str,
            _arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<Vec<ToolSegment>, BackendError> {
            Ok(Vec::new())
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(
            vec!["canvas.".to_string()],
            vec![
                BackendRoute::new("aws-diagram", "aws_", Arc::new(Named("aws-diagram"))),
                BackendRoute::new("aws-knowledge", "aws_knowledge", Arc::new(Named("aws-knowledge"))),
                BackendRoute::new("tavily", "tavily_", Arc::new(Named("tavily"))),
                BackendRoute::new("perplexity", "perplexity_", Arc::new(Named("perplexity"))),
            ],
        )
    }

    fn target_name(registry: &ToolRegistry, tool: &str) -> String {
        match registry.classify(tool) {
            ToolTarget::Internal => "internal".to_string(),
            ToolTarget::Backend(route) => route.name.clone(),
            ToolTarget::Unsupported => "unsupported".to_string(),
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = registry();
        assert_eq!(target_name(&registry, "aws_knowledge_search"), "aws-knowledge");
        assert_eq!(target_name(&registry, "aws_generate_diagram"), "aws-diagram");
        assert_eq!(target_name(&registry, "tavily_search"), "tavily");
        assert_eq!(target_name(&registry, "canvas.append_note"), "internal");
        assert_eq!(target_name(&registry, "perplexity_search"), "perplexity");
        assert_eq!(target_name(&registry, "bing_search"), "unsupported");
    }

    #[test]
    fn test_enrich_only_fills_missing_keys() {
        let route = BackendRoute::new("tavily", "tavily_", Arc::new(Named("tavily"))).with_defaults(
            json!({"max_results": 4, "search_depth": "basic"})
                .as_object()
                .cloned()
                .unwrap(),
        );

        let enriched = route.enrich(json!({"query": "foo", "max_results": 10}));
        assert_eq!(
            enriched,
            json!({"query": "foo", "max_results": 10, "search_depth": "basic"})
        );
        assert_eq!(route.enrich(json!("raw")), json!("raw"));
    }

    #[test]
    fn test_heading_expands_tool_name() {
        let route = BackendRoute::new("tavily", "tavily_", Arc::new(Named("tavily")))
            .with_summary_heading("Tavily {tool} results:");
        assert_eq!(
            route.heading_for("tavily_search").as_deref(),
            Some("Tavily tavily_search results:")
        );
    }

    #[test]
    fn test_from_default_settings() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(dir.path().join("config.yaml"), dir.path().join("secrets.yaml"));
        config
            .set_secret("tavily_api_key", json!("tvly-123"))
            .unwrap();

        let registry = ToolRegistry::from_settings(&RealtimeSettings::default(), &config).unwrap();
        let names: Vec<&str> = registry.routes().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["aws-knowledge", "tavily", "perplexity", "aws-diagram"]);
        assert!(registry.routes()[1].informational);
        assert_eq!(registry.routes()[1].defaults["max_results"], 4);

        let perplexity = &registry.routes()[2];
        assert!(perplexity.informational);
        assert_eq!(
            perplexity.enrich(json!({"query": "tokio", "max_results": 2})),
            json!({"query": "tokio", "max_results": 2, "max_tokens_per_page": 1024})
        );
        assert_eq!(
            perplexity.heading_for("perplexity_search").as_deref(),
            Some("Perplexity search results:")
        );

        let diagram = &registry.routes()[3];
        assert!(!diagram.informational);
        assert_eq!(diagram.result_hook, Some(ResultHook::DiagramCanvas));
        assert!(matches!(
            registry.classify("perplexity_search"),
            ToolTarget::Backend(route) if route.name == "perplexity"
        ));
    }
}
