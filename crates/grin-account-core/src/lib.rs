#![doc = include_str!("../README.md")]

mod common;
pub mod token;

pub use common::*;
