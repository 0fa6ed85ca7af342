pub mod http_metrics;
pub mod user_id;

pub use http_metrics::http_metrics_middleware;
pub use user_id::UserId;
