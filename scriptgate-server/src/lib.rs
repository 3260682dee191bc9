//! The axum server exposing a directory of command files as HTTP endpoints.
//!
//! Build a [`config::ServerConfig`], then [`mount::router`] scans the
//! commands directory and returns the router serving it.

pub mod args;
pub mod cleanup;
pub mod config;
pub mod discovery;
pub mod guard;
pub mod mount;
pub mod process;
pub mod request;
pub mod response;
