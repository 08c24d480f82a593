//! The `account.UserService` handler and the pieces it is built from.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point ([`AccountService`]).
//! - [`captcha`] - Captcha verification, remote or injected.
//! - [`contact`] - Phone number / e-mail parsing.
//! - [`store`] - Account records and their storage.
//! - [`password`] - Password hashing.

pub mod captcha;
pub mod contact;
pub mod handler;
pub mod password;
pub mod store;

pub use captcha::{CaptchaVerifier, RemoteCaptcha};
pub use handler::AccountService;
pub use password::{Argon2Hasher, PasswordHasher};
pub use store::{MemoryUserStore, UserQuery, UserRecord, UserStore};

use grin_account_core::proto::account::user_service_server::UserServiceServer;
use tonic::codec::CompressionEncoding;

/// Wraps `service` in its generated server with compression enabled.
pub fn build_user_service(service: AccountService) -> UserServiceServer<AccountService> {
    UserServiceServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}
