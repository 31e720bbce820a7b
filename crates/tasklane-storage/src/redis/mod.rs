//! Redis task provider.
//!
//! - `keys`: key layout under the configured prefix
//! - `record`: stored records as flat hashes
//! - `scripts`: Lua for atomic multi-key writes
//! - `provider`: [`RedisTaskProvider`] over a `deadpool-redis` pool

pub mod keys;
pub mod provider;
pub mod record;
pub mod scripts;

pub use keys::TaskKeys;
pub use provider::{RedisTaskProvider, sanitize_error};
