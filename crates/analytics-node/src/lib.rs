pub mod api;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod error;
pub mod manager;
pub mod source;
pub mod state;
pub mod store;
pub mod worker;

pub use backend::registry::BackendRegistry;
pub use config::AnalyticsConfig;
pub use manager::StreamManager;
pub use state::AnalyticsState;
pub use store::ResultStore;
