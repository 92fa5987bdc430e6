pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod routes;

pub use error::ApiError;
pub use middleware::LATENCY_HEADER;
pub use router::{CacheTarget, ClickOutcome, DeferredTask, EdgeRouter, RejectReason};
pub use routes::create_edge_router;
