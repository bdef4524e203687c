//! In-memory group session store
//!
//! Group content and device-to-device payloads are sealed with
//! ChaCha20-Poly1305. Device channel keys are derived from the recipient's
//! public device key, which is fine for tests and nothing else.

use crate::decryption::{
    DecryptionError, DecryptionResult, EncryptedData, GroupEncryptionAlgorithmId,
    GroupEncryptionCrypto, GroupEncryptionSession, SessionId, StreamId, UserDevice,
};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const DEVICE_CHANNEL_CONTEXT: &str = "keyrelay test 2024 device channel";

fn seal(key: &[u8], plaintext: &[u8]) -> String {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce: [u8; 12] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("encryption failed");
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    hex::encode(out)
}

fn open(key: &[u8], sealed: &str) -> DecryptionResult<Vec<u8>> {
    let bytes = hex::decode(sealed).map_err(|e| DecryptionError::Crypto(e.to_string()))?;
    if bytes.len() < 12 {
        return Err(DecryptionError::Crypto("ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = bytes.split_at(12);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DecryptionError::Crypto("authentication failed".to_string()))
}

fn device_channel_key(device_key: &str) -> [u8; 32] {
    blake3::derive_key(DEVICE_CHANNEL_CONTEXT, device_key.as_bytes())
}

/// Group session store for a single device
pub struct MemoryCrypto {
    device: UserDevice,
    sessions: Mutex<HashMap<StreamId, BTreeMap<SessionId, GroupEncryptionSession>>>,
    fail_imports: AtomicBool,
}

impl MemoryCrypto {
    pub fn new(name: &str) -> Self {
        let device = UserDevice {
            device_key: blake3::hash(name.as_bytes()).to_hex().to_string(),
            fallback_key: blake3::hash(format!("{}-fallback", name).as_bytes()).to_hex().to_string(),
        };
        Self {
            device,
            sessions: Mutex::new(HashMap::new()),
            fail_imports: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> UserDevice {
        self.device.clone()
    }

    /// Create a fresh session for encrypting our own messages
    pub fn create_outbound_session(&self, stream_id: &str) -> SessionId {
        let session_id = hex::encode(rand::random::<[u8; 16]>());
        let session = GroupEncryptionSession {
            stream_id: stream_id.to_string(),
            session_id: session_id.clone(),
            session_key: hex::encode(rand::random::<[u8; 32]>()),
            algorithm: GroupEncryptionAlgorithmId::GroupEncryption,
        };
        self.sessions
            .lock()
            .unwrap()
            .entry(stream_id.to_string())
            .or_default()
            .insert(session_id.clone(), session);
        session_id
    }

    pub fn encrypt_group_event(&self, stream_id: &str, session_id: &str, plaintext: &str) -> EncryptedData {
        let session = self
            .session(stream_id, session_id)
            .expect("encrypting with unknown session");
        let key = hex::decode(&session.session_key).unwrap();
        EncryptedData {
            ciphertext: seal(&key, plaintext.as_bytes()),
            algorithm: session.algorithm.as_str().to_string(),
            sender_key: self.device.device_key.clone(),
            session_id: session_id.to_string(),
            session_id_bytes: hex::decode(session_id).unwrap(),
        }
    }

    pub fn decrypt_group_content(&self, stream_id: &str, data: &EncryptedData) -> DecryptionResult<String> {
        let session_id = data.session_id();
        let session = self.session(stream_id, &session_id).ok_or_else(|| {
            DecryptionError::SessionNotFound {
                stream_id: stream_id.to_string(),
                session_id: session_id.clone(),
            }
        })?;
        let key = hex::decode(&session.session_key).map_err(|e| DecryptionError::Crypto(e.to_string()))?;
        let plaintext = open(&key, &data.ciphertext)?;
        String::from_utf8(plaintext).map_err(|e| DecryptionError::Crypto(e.to_string()))
    }

    /// Seal a payload so only the holder of `recipient_device_key` reads it
    pub fn encrypt_for_device(&self, recipient_device_key: &str, plaintext: &str) -> String {
        seal(&device_channel_key(recipient_device_key), plaintext.as_bytes())
    }

    pub fn set_fail_imports(&self, fail: bool) {
        self.fail_imports.store(fail, Ordering::SeqCst);
    }

    pub fn session(&self, stream_id: &str, session_id: &str) -> Option<GroupEncryptionSession> {
        self.sessions
            .lock()
            .unwrap()
            .get(stream_id)
            .and_then(|s| s.get(session_id))
            .cloned()
    }

    pub fn session_count(&self, stream_id: &str) -> usize {
        self.sessions.lock().unwrap().get(stream_id).map_or(0, |s| s.len())
    }

    pub fn insert_session(&self, session: GroupEncryptionSession) {
        self.sessions
            .lock()
            .unwrap()
            .entry(session.stream_id.clone())
            .or_default()
            .insert(session.session_id.clone(), session);
    }
}

#[async_trait]
impl GroupEncryptionCrypto for MemoryCrypto {
    async fn decrypt_with_device_key(
        &self,
        ciphertext: &str,
        _sender_device_key: &str,
    ) -> DecryptionResult<String> {
        let plaintext = open(&device_channel_key(&self.device.device_key), ciphertext)?;
        String::from_utf8(plaintext).map_err(|e| DecryptionError::Crypto(e.to_string()))
    }

    async fn has_session_key(
        &self,
        stream_id: &str,
        session_id: &str,
        algorithm: GroupEncryptionAlgorithmId,
    ) -> DecryptionResult<bool> {
        Ok(self
            .session(stream_id, session_id)
            .map_or(false, |s| s.algorithm == algorithm))
    }

    async fn import_session_keys(
        &self,
        _stream_id: &str,
        sessions: Vec<GroupEncryptionSession>,
    ) -> DecryptionResult<()> {
        if self.fail_imports.load(Ordering::SeqCst) {
            return Err(DecryptionError::Crypto("session store unavailable".to_string()));
        }
        for session in sessions {
            self.insert_session(session);
        }
        Ok(())
    }

    async fn get_group_session_ids(&self, stream_id: &str) -> DecryptionResult<Vec<SessionId>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(stream_id)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn export_group_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> DecryptionResult<Option<GroupEncryptionSession>> {
        Ok(self.session(stream_id, session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_content_roundtrip_needs_session() {
        let alice = MemoryCrypto::new("alice");
        let bob = MemoryCrypto::new("bob");
        let session_id = alice.create_outbound_session("s1");
        let data = alice.encrypt_group_event("s1", &session_id, "hello");

        assert_eq!(alice.decrypt_group_content("s1", &data).unwrap(), "hello");
        let err = bob.decrypt_group_content("s1", &data).unwrap_err();
        assert!(err.is_session_not_found());

        bob.insert_session(alice.session("s1", &session_id).unwrap());
        assert_eq!(bob.decrypt_group_content("s1", &data).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_device_channel_only_opens_for_recipient() {
        let alice = MemoryCrypto::new("alice");
        let bob = MemoryCrypto::new("bob");
        let sealed = alice.encrypt_for_device(&bob.device().device_key, "{\"keys\":[]}");

        assert_eq!(
            bob.decrypt_with_device_key(&sealed, &alice.device().device_key).await.unwrap(),
            "{\"keys\":[]}"
        );
        assert!(alice.decrypt_with_device_key(&sealed, "").await.is_err());
    }
}
