pub mod auth;
pub mod broker;
pub mod config;
mod connection;
pub mod dissemination;
pub mod gateway;
pub mod http;
pub mod mqtt;
pub mod periodic;
pub mod session;

pub use config::{GatewayConfig, ServeArgs, TlsConfig};
pub use gateway::{Gateway, GatewayError, GatewayHandle, GatewayServices, SignalServices};
