//! Password-derived session keys, the private-mode frame cipher and the frame signer

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use hmac::digest::generic_array::GenericArray;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::protocol::kdf;

type HmacSha256 = Hmac<Sha256>;

// Distinct keystreams per direction so both peers can encrypt concurrently
const CLIENT_TO_SERVER: [u8; 12] = *b"spm-c2s-v1\0\0";
const SERVER_TO_CLIENT: [u8; 12] = *b"spm-s2c-v1\0\0";

/// Key material derived from a subject secret and a per-session salt.
pub struct SessionKey {
    material: [u8; kdf::KEY_MATERIAL],
}

impl SessionKey {
    /// PBKDF2-HMAC-SHA256 over the stored secret and the client-chosen salt.
    pub fn derive(secret: &str, salt: &[u8], rounds: u32) -> Self {
        let mut material = [0u8; kdf::KEY_MATERIAL];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, rounds, &mut material);
        Self { material }
    }

    fn cipher_key(&self) -> &[u8] {
        &self.material[..32]
    }

    fn mac_key(&self) -> &[u8] {
        &self.material[32..]
    }
}

/// One direction of the private-mode keystream.
pub struct FrameCipher {
    inner: ChaCha20,
}

impl FrameCipher {
    fn new(key: &SessionKey, nonce: &[u8; 12]) -> Self {
        Self {
            inner: ChaCha20::new(Key::from_slice(key.cipher_key()), Nonce::from_slice(nonce)),
        }
    }

    /// Encrypt or decrypt in place; the keystream position advances.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

/// Computes and verifies frame authentication tags.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            mac: <HmacSha256 as Mac>::new(GenericArray::from_slice(key.mac_key())),
        }
    }

    /// Hex-encoded HMAC-SHA256 of `text`.
    pub fn sign(&self, text: &str) -> String {
        hex::encode(self.digest(text))
    }

    /// Constant-time comparison of `tag` against the expected tag for `text`.
    ///
    /// Compares the canonical lowercase encoding so that case variants of a
    /// valid tag are not accepted.
    pub fn verify(&self, text: &str, tag: &str) -> bool {
        let expected = self.sign(text);
        expected.as_bytes().ct_eq(tag.as_bytes()).into()
    }

    fn digest(&self, text: &str) -> [u8; 32] {
        let mut mac = self.mac.clone();
        mac.update(text.as_bytes());
        mac.finalize().into_bytes().into()
    }
}

/// Cipher and signer installed together when a session is upgraded.
pub struct SessionCrypto {
    pub inbound: FrameCipher,
    pub outbound: FrameCipher,
    pub signer: Signer,
}

impl SessionCrypto {
    /// Server side: decrypts client frames, encrypts replies.
    pub fn for_server(key: &SessionKey) -> Self {
        Self {
            inbound: FrameCipher::new(key, &CLIENT_TO_SERVER),
            outbound: FrameCipher::new(key, &SERVER_TO_CLIENT),
            signer: Signer::new(key),
        }
    }

    /// Client side, the mirror image of [`SessionCrypto::for_server`].
    pub fn for_client(key: &SessionKey) -> Self {
        Self {
            inbound: FrameCipher::new(key, &SERVER_TO_CLIENT),
            outbound: FrameCipher::new(key, &CLIENT_TO_SERVER),
            signer: Signer::new(key),
        }
    }
}
