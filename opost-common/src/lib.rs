//! # OPost Common Library
//!
//! Shared code for the OPost courier network services including:
//! - Database models and schema initialization
//! - Event types (OpostEvent enum) and EventBus
//! - Delivery-code signing and token formats
//! - OP code parsing and zone prefix matching
//! - Configuration loading
//! - Request authentication helpers

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod opcode;
pub mod signing;

pub use error::{Error, Result};
pub use opcode::OpCode;
