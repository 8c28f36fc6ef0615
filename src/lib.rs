//! File and folder page plugins, and the migration that moves file plugins
//! from raw media paths onto managed filer records.

pub mod config;
pub mod db;
pub mod error;
pub mod filer;
pub mod logging;
pub mod migration;
pub mod paths;
pub mod plugin;
pub mod schema;

pub use error::{AppError, AppResult};
