/// Builds the gRPC client and server code for the `account.proto` and
/// `captcha.proto` definitions using `tonic-prost-build`.
///
/// # Files and Paths
///
/// - Proto files: `proto/account.proto`, `proto/captcha.proto`
/// - Includes: `proto/`
///
/// # Output
///
/// Generated code is accessible in Rust via:
///
/// ```rust
/// pub mod account {
///     tonic::include_proto!("account");
/// }
/// ```
///
/// A combined descriptor set (`account_descriptor.bin`) is emitted alongside
/// the bindings for the reflection service.
///
/// # Panics
///
/// Panics if code generation fails.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("account_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(
            config,
            &["proto/account.proto", "proto/captcha.proto"],
            &["proto"],
        )
        .unwrap();
}
