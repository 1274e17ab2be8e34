pub mod audit;
pub mod auth;
pub mod governance;
pub mod headers;
pub mod metrics;
