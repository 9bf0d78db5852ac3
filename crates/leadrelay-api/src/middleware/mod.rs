//! HTTP middleware for the admin server.
pub mod auth;
