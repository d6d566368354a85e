#![forbid(unsafe_code)]

//! Shared building blocks for the subtitle staging server: configuration,
//! credential storage, sessions, the staging directory and the
//! upload-and-normalize pipeline.

pub mod config;
pub mod credentials;
pub mod normalizer;
pub mod pages;
pub mod pipeline;
pub mod security;
pub mod session;
pub mod staging;
pub mod transcoder;
