//! Test utilities for the decryption engine
//!
//! In-memory collaborators plus fixtures that wire two or more devices
//! together through an outbox so key exchange can be driven end to end.

pub mod mock_crypto;
pub mod mock_delegate;

pub use async_helpers::*;
pub use fixtures::*;
pub use mock_crypto::*;
pub use mock_delegate::*;
