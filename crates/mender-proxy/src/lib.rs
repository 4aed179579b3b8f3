//! Mender: a compatibility proxy between chat clients that speak an
//! Anthropic-flavoured dialect of the OpenAI chat API and a strict
//! OpenAI-compatible relay (LiteLLM).
//!
//! Every chat completion request runs through one pipeline before it is
//! forwarded:
//! - strip cache annotations at any depth ([`sanitize`])
//! - reshape `tool_use`/`tool_result` blocks into `tool_calls` and `tool`
//!   messages ([`translation`])
//! - drop orphaned tool results and rejected parameters ([`history`])
//!
//! Responses (streamed or buffered) are relayed back unmodified.

pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod pipeline;
pub mod sanitize;
pub mod server;
pub mod streaming;
pub mod translation;
pub mod types;

pub use config::{Policy, ProxyConfig};
pub use error::{ConfigError, GatewayError, PipelineError, ProxyError};
pub use server::{bind, serve};
