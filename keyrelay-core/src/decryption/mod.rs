//! Decryption and key exchange engine
//!
//! Receives group-encrypted events and group session deliveries, decrypts
//! what it can, requests keys it is missing from other members and answers
//! their requests in turn. All work is funneled through prioritized queues
//! and processed one item per tick by a single background task.
//!
//! Collaborators are supplied by the client through [`DecryptionDelegate`]
//! and [`GroupEncryptionCrypto`].

pub mod delegate;
pub mod errors;
pub mod extensions;
mod handlers;
pub mod queues;
pub mod status;
pub mod types;


pub use delegate::{DecryptionDelegate, GroupEncryptionCrypto};
pub use errors::{AddEventError, DecryptionError, DecryptionResult, KeyFulfillmentResponse};
pub use extensions::DecryptionExtensions;
pub use queues::{PriorityTask, QueueSizes};
pub use status::DecryptionStatus;
pub use types::*;
