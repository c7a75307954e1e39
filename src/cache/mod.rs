//! Versioned response caching.
//!
//! - Responses live in named stores, one store per cache generation
//! - A generation is pre-populated from a fixed manifest before it may serve
//! - Requests are answered cache-first and successful network responses are
//!   written back opportunistically
//! - Superseded generations are deleted once a new one takes over

mod generation;
mod policy;
mod storage;

pub use generation::{GenerationId, GenerationManager, Manifest, ReclaimOutcome};
pub use policy::{pass_through, InterceptionPolicy, ServeSource, Served};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
