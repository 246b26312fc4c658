//! Product resolution: caches, the deterministic engine, the queue worker
//! and the stuck-request sweeper.

pub mod caches;
pub mod engine;
pub mod evidence;
pub mod scoring;
pub mod sweeper;
pub mod worker;

pub use caches::{BrandAliasCache, TrustCache};
pub use engine::{ResolveOutcome, Resolver, RESOLVER_VERSION};
pub use sweeper::StuckJobSweeper;
pub use worker::{resolve_job_id, EmbeddingJob, ResolveJob, ResolverWorker};
