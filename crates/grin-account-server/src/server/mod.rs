//! Server-side components of the account service.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration and validation.
//! - [`telemetry`] - Structured logging initialization.
//! - [`interceptor`] - Fault recovery and bearer token authentication stages
//!   wrapped around every inbound call.
//! - [`discovery`] - Service registration and endpoint resolution backends.
//! - [`connector`] - Round-robin client channels over discovered endpoints.
//! - [`lifecycle`] - Startup, registration, serving and graceful drain.
//! - [`service`] - The `account.UserService` handler and its storage.
//!
//! These components are wired together in the server's `main.rs`.

pub mod config;
pub mod connector;
pub mod discovery;
pub mod interceptor;
pub mod lifecycle;
pub mod service;
pub mod telemetry;
