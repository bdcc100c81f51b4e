//! Storage-layer queries. Functions are generic over `sqlx::Executor` so
//! callers can run them against the pool or inside a transaction.

pub mod platforms;
pub mod posts;
pub mod sends;
