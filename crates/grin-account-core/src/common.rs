//! Shared types, error definitions and protocol bindings.
//!
//! ## Submodules
//!
//! - [`error`] - Centralized error type and its `tonic::Status` mapping.
//! - [`types`] - Wire constants for the bearer token contract.
//! - [`proto`] - Generated `account` and `captcha` bindings.

pub mod error;
pub mod types;

pub use error::{AuthError, Error, Result};

pub mod proto {
    /// `account.UserService` messages, client and server.
    pub mod account {
        tonic::include_proto!("account");
    }

    /// `captcha.CaptchaService` messages, client and server.
    pub mod captcha {
        tonic::include_proto!("captcha");
    }

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("account_descriptor");
}
