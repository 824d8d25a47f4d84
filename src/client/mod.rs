//! Client-side configuration and connection upkeep
//!
//! - [`ClientConfig`]: URL and tuning knobs shared by connections and sessions
//! - [`Reconnector`]: keeps a connection open with exponential backoff

pub mod config;
pub mod reconnect;

pub use config::{parse_url, ClientConfig, ParsedUrl, Scheme};
pub use reconnect::{ReconnectHandle, ReconnectPolicy, Reconnector};
