pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod evolution;
pub mod models;
pub mod reconciler;
pub mod state;
pub mod store;
pub mod webhook;
