//! Credential storage for cached OAuth accounts

pub mod keyring;
mod memory;
mod token_cache;

// Re-export commonly used items
pub use keyring::{CacheError, KeyringBackend, TokenCacheBackend};
pub use memory::MemoryBackend;
pub use token_cache::{CacheDocument, CachedAccount, TokenCache};
