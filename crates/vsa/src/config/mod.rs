mod base;
mod realtime;

pub use base::{Config, ConfigError, APP_STRATEGY};
pub use realtime::{
    default_backends, BackendSettings, BackendTransport, RealtimeSettings, ResultHook,
};
