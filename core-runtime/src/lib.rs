//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the decode pipeline crates:
//! - Logging and tracing infrastructure
//! - Event bus for pipeline milestones
//!
//! ## Overview
//!
//! This crate establishes the logging conventions and the event broadcasting
//! mechanism used throughout the workspace. It has no knowledge of media types;
//! events carry stream kinds and decoder names as plain strings.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
