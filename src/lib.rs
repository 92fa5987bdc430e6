pub mod backend;
pub mod config;
pub mod detection;
pub mod edge;
pub mod failover;
pub mod link;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod routing;
pub mod storage;
