//! Multi-protocol connection relay
//!
//! Listens on local ports according to declarative rules and forwards raw TCP
//! streams, HTTP requests and WebSocket sessions to remote targets, optionally
//! binding outbound connections to a configured local source address.

pub mod config;
pub mod dial;
pub mod http;
pub mod listener;
pub mod rule;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod websocket;

// Re-export commonly used types and functions
pub use config::{Config, DEFAULT_CONFIG_FILE, ListenConfig, load_config, parse_config};
pub use listener::{RelayContext, RunningRule, start_all, start_rule};
pub use rule::{Rule, RuleKind, SourceAddress, Target};
pub use stream::UpstreamStream;
