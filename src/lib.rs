pub mod briefing;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod recurrence;
pub mod scheduler;
pub mod store;
pub mod wire;
