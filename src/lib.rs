pub mod analytics;
pub mod config;
pub mod database;
pub mod generation;
pub mod models;
pub mod orchestrator;
pub mod personas;
pub mod policy;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod thread_store;
pub mod webhook;
