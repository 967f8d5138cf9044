//! Chat Store: local persistence for conversation threads and messages.

pub mod chat;
pub mod config;
pub mod error;
pub mod store;

pub use chat::{ChatStore, Message, Role, Thread};
pub use config::{StoreConfig, StoreLocation};
pub use error::{DatabaseError, Error, Result};
