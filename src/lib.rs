pub mod api;
pub mod config;
pub mod routes;
pub mod snapshot;
pub mod url_repo;
pub mod url_service;
