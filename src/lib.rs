pub mod config;
pub mod error;
pub mod pkg_manager;
pub mod ui;
pub mod workspace;
