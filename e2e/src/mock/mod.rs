pub mod aggregator;
pub mod async_backend;
pub mod client;
pub mod http_origin;
