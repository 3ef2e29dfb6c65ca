use std::collections::HashMap;

pub mod http;
pub mod stdio;

pub use http::HttpJsonRpcBackend;
pub use stdio::StdioBackend;

/// Translation from the tool names the model sees to the names the backend
/// actually exposes. Names without an entry pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct ToolNameMap(HashMap<String, String>);

impl ToolNameMap {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self(map)
    }

    pub fn resolve<'a>(&'a self, tool: &'a str) -> &'a str {
        self.0.get(tool).map(String::as_str).unwrap_or(tool)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ToolNameMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
