mod actor;
pub mod config;
mod error;
mod http_layers;
mod job_routes;
pub mod metrics;
mod notification_routes;
pub mod server;
pub mod state;
mod user_routes;

pub use actor::{AdminActor, HEADER_ADMIN_USER_KEY};
pub use config::ServerConfig;
pub use error::ApiError;
pub use http_layers::*;
pub use server::{make_app, make_metrics_app, run_server};
pub use state::ServerState;
