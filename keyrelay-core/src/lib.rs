//! keyrelay-core: decryption and key exchange orchestration for end-to-end
//! encrypted group streams.

pub mod config;
pub mod decryption;
pub mod logging;
pub mod metrics;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::DecryptionConfig;
pub use decryption::{
    DecryptionDelegate, DecryptionError, DecryptionExtensions, DecryptionResult, DecryptionStatus,
    GroupEncryptionCrypto,
};
pub use logging::{init_logging, LogLevel};
