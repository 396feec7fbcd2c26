pub mod broker;
pub mod config;
pub mod connection;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod models;
pub mod routes;
pub mod session;
pub mod store;

use std::sync::Arc;

use axum::extract::FromRef;

pub use error::{AppError, AppResult, ChatError, Result};

use crate::{broker::Broker, config::ConnectionSettings, directory::Directory};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub directory: Arc<Directory>,
    pub broker: Arc<dyn Broker>,
    pub settings: ConnectionSettings,
}
