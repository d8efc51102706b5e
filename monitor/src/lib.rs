pub mod commands;
pub mod error;
pub mod repositories;
pub mod scheduler;
pub mod services;
pub mod state;

pub use error::MonitorError;
pub use state::{AppState, Collaborators, MonitorSettings};
