// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Channel handshake and per-packet encryption.
//!
//! Either endpoint of a pending channel sends one handshake blob:
//!
//! ```text
//! u16 id_pubkey_len   | id_pubkey[len]     identity public key (DER)
//! u16 sess_pubkey_len | sess_pubkey[len]   ephemeral ECDH key (DER)
//! u16 sig_len         | sig[len]           identity.sign(sess_pubkey)
//! ```
//!
//! The signature binds the ephemeral key to the long-lived identity, so
//! a man in the middle cannot swap session keys. Once both blobs are
//! exchanged the endpoints derive `SHA-256(ECDH secret)`: the first 16
//! bytes key AES-128-CBC, the next 16 seed the per-packet IV
//! `SHA-256(shared_iv || seq_le)[..16]`.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use p256::{PublicKey, SecretKey, ecdh,
           pkcs8::{DecodePublicKey, EncodePublicKey}};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{crypto::identity::Identity, models::identifier::Identifier};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Why a handshake was rejected. Handshake failures are never retried;
/// the channel is abandoned and reported via `connection_failed`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake truncated at {0} bytes")]
    Truncated(usize),
    #[error("unparsable key in handshake")]
    BadKey,
    #[error("session key signature invalid")]
    BadSignature,
    #[error("peer identity {got} does not match expected {expected}")]
    WrongPeer {
        expected: Identifier,
        got: Identifier,
    },
    #[error("service rejected the connection")]
    ServiceRejected,
}

#[derive(Debug, Error)]
#[error("datagram decryption failed for seq {seq}")]
pub struct DecryptError {
    pub seq: u32,
}

/// The verified content of a peer's handshake blob.
#[derive(Debug)]
pub struct PeerHandshake {
    pub identity: Identity,
    pub session_key: PublicKey,
}

fn read_field(buf: &[u8], at: &mut usize) -> Result<std::ops::Range<usize>, HandshakeError> {
    let len_end = at
        .checked_add(2)
        .filter(|end| *end <= buf.len())
        .ok_or(HandshakeError::Truncated(buf.len()))?;
    let len = u16::from_be_bytes([buf[*at], buf[*at + 1]]) as usize;
    let end = len_end
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or(HandshakeError::Truncated(buf.len()))?;
    *at = end;
    Ok(len_end..end)
}

/// The local half of a channel handshake: an ephemeral ECDH keypair and
/// the signed blob advertising it.
pub struct SessionHandshake {
    secret: SecretKey,
    blob: Vec<u8>,
}

impl SessionHandshake {
    /// Generates the ephemeral keypair and builds the handshake blob
    /// signed by `identity` (which must hold a private key).
    pub fn build(identity: &Identity) -> anyhow::Result<Self> {
        let secret = SecretKey::random(&mut OsRng);
        let sess_der = secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| anyhow::anyhow!("failed to encode session key: {e}"))?
            .into_vec();
        let id_der = identity.public_key_der()?;
        let sig = identity.sign(&sess_der)?;

        let mut blob = Vec::with_capacity(6 + id_der.len() + sess_der.len() + sig.len());
        for field in [&id_der, &sess_der, &sig] {
            blob.extend_from_slice(&(field.len() as u16).to_be_bytes());
            blob.extend_from_slice(field);
        }
        Ok(SessionHandshake { secret, blob })
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Parses and verifies the peer's blob: the signature over the
    /// session key must check out under the identity key it carries.
    pub fn verify_peer(blob: &[u8]) -> Result<PeerHandshake, HandshakeError> {
        let mut at = 0;
        let id_key = read_field(blob, &mut at)?;
        let sess_key = read_field(blob, &mut at)?;
        let sig = read_field(blob, &mut at)?;

        let identity = Identity::from_public_key_der(&blob[id_key])
            .map_err(|_| HandshakeError::BadKey)?;
        if !identity.verify(&blob[sess_key.clone()], &blob[sig]) {
            return Err(HandshakeError::BadSignature);
        }
        let session_key = PublicKey::from_public_key_der(&blob[sess_key])
            .map_err(|_| HandshakeError::BadKey)?;
        Ok(PeerHandshake {
            identity,
            session_key,
        })
    }

    /// Runs ECDH against the peer's session key and derives the packet
    /// cipher state. Consumes the ephemeral secret.
    pub fn derive(self, peer_session_key: &PublicKey) -> CipherState {
        let shared = ecdh::diffie_hellman(
            self.secret.to_nonzero_scalar(),
            peer_session_key.as_affine(),
        );
        let digest = Sha256::digest(shared.raw_secret_bytes());
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        iv.copy_from_slice(&digest[16..]);
        CipherState { key, iv }
    }
}

/// Symmetric state of an established channel.
#[derive(Clone)]
pub struct CipherState {
    key: [u8; 16],
    iv: [u8; 16],
}

impl CipherState {
    #[cfg(test)]
    pub fn from_raw(key: [u8; 16], iv: [u8; 16]) -> Self {
        CipherState { key, iv }
    }

    fn packet_iv(&self, seq: u32) -> [u8; 16] {
        let mut h = Sha256::new();
        h.update(self.iv);
        h.update(seq.to_le_bytes());
        let digest = h.finalize();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);
        iv
    }

    /// AES-128-CBC with PKCS#7 padding under the per-sequence IV.
    pub fn encrypt(&self, seq: u32, plaintext: &[u8]) -> Vec<u8> {
        let iv = self.packet_iv(seq);
        Aes128CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, seq: u32, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let iv = self.packet_iv(seq);
        Aes128CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| DecryptError { seq })
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("CipherState { .. }")
    }
}
