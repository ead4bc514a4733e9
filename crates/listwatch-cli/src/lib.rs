//! Listwatch CLI - command-line interface for the listing collection pipeline
//!
//! This crate provides the CLI application that ties together all listwatch components.

pub mod config;

pub use config::{Command, Config, CredentialAction};
