//! M365 Deck - Microsoft 365 badges for Stream Deck
//!
//! Calendar and mail keys that poll Microsoft Graph on behalf of a cached
//! account and draw an animated badge. The host integration builds one
//! [`PluginContext`] and one [`actions::BadgeAction`] per key.

pub mod actions;
pub mod animation;
pub mod auth;
pub mod badge;
pub mod config;
pub mod context;
pub mod graph;
pub mod logging;
pub mod notifier;
pub mod storage;

pub use config::PluginConfig;
pub use context::PluginContext;
pub use logging::init_logging;
