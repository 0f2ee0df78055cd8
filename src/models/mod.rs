//! Domain models for the affiliate feed ingestion core (SPEC_FULL §3).

pub mod feed;
pub mod job;
pub mod link;
pub mod price;
pub mod product;
pub mod quarantine;
pub mod run;

pub use feed::{ChangeDetectionMemo, Feed, FeedConnection, FeedStatus, Transport};
pub use job::{AlertJob, AlertTopic, IngestJob, ResolverJob, ResolverReason};
pub use link::{LinkStatus, MatchType, ProductLink};
pub use price::{CachedPrice, Price, PriceType};
pub use product::{
    IdType, SourceProduct, SourceProductIdentifier, SourceProductPresence, SourceProductSeen,
};
pub use quarantine::QuarantinedRecord;
pub use run::{
    CircuitBreakerMetrics, FeedRun, RunCounters, RunError, RunStatus, RunTrigger, SkippedReason,
};
