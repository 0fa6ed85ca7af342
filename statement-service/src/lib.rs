pub mod config;
pub mod dtos;
pub mod handlers;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod processor;
pub mod reconcile;
pub mod services;
pub mod startup;
pub mod workers;
