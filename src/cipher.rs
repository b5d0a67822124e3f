//! Secret-keyed primitives: authenticated encryption for cookie payloads,
//! MACs for signed identifiers, salted password hashes and random tokens.
//!
//! All keys are loaded once at startup and live for the whole process.

use std::fmt;
use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hmac, pbkdf2};

use crate::error::{Result, WorkbenchError};

pub const CIPHER_KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 32;
const HASH_SCHEME: &str = "pbkdf2_sha256";
const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub struct Cipher {
    aead: LessSafeKey,
    mac: hmac::Key,
    rng: SystemRandom,
    iterations: NonZeroU32,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(cipher_key: &[u8], mac_key: &[u8]) -> Result<Self> {
        if cipher_key.len() != CIPHER_KEY_LEN {
            return Err(WorkbenchError::InputInvalid(format!(
                "cipher key must be {CIPHER_KEY_LEN} bytes, got {}",
                cipher_key.len()
            )));
        }
        if mac_key.is_empty() {
            return Err(WorkbenchError::InputInvalid("mac key must not be empty".into()));
        }
        let unbound = UnboundKey::new(&aead::CHACHA20_POLY1305, cipher_key)
            .map_err(|_| WorkbenchError::InputInvalid("unusable cipher key".into()))?;

        Ok(Self {
            aead: LessSafeKey::new(unbound),
            mac: hmac::Key::new(hmac::HMAC_SHA256, mac_key),
            rng: SystemRandom::new(),
            iterations: NonZeroU32::new(DEFAULT_PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN),
        })
    }

    /// Lowers the PBKDF2 work factor for new hashes. Existing hashes keep the
    /// iteration count they were written with.
    pub fn with_pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.iterations = NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN);
        self
    }

    /// Fresh random keys, for processes started without configured secrets.
    pub fn generate_keys() -> Result<(Vec<u8>, Vec<u8>)> {
        let rng = SystemRandom::new();
        let mut cipher_key = vec![0u8; CIPHER_KEY_LEN];
        let mut mac_key = vec![0u8; 32];
        rng.fill(&mut cipher_key)
            .and_then(|_| rng.fill(&mut mac_key))
            .map_err(|_| WorkbenchError::Internal("system randomness unavailable".into()))?;
        Ok((cipher_key, mac_key))
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.rng
            .fill(&mut buf)
            .map_err(|_| WorkbenchError::Internal("system randomness unavailable".into()))?;
        Ok(buf)
    }

    /// Layout: nonce || ciphertext || tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.random_bytes(NONCE_LEN)?;
        let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
            .map_err(|_| WorkbenchError::Internal("bad nonce length".into()))?;

        let mut in_out = plaintext.to_vec();
        self.aead
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| WorkbenchError::Internal("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(WorkbenchError::TamperDetected);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| WorkbenchError::TamperDetected)?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .aead
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| WorkbenchError::TamperDetected)?;
        Ok(plaintext.to_vec())
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        hmac::sign(&self.mac, data).as_ref().to_vec()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        hmac::verify(&self.mac, data, signature).is_ok()
    }

    /// `pbkdf2_sha256$<iterations>$<salt>$<digest>`, base64 without padding.
    pub fn hash_password(&self, password: &str) -> Result<String> {
        let salt = self.random_bytes(SALT_LEN)?;
        let mut digest = [0u8; DIGEST_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            &salt,
            password.as_bytes(),
            &mut digest,
        );
        Ok(format!(
            "{HASH_SCHEME}${}${}${}",
            self.iterations,
            STANDARD_NO_PAD.encode(&salt),
            STANDARD_NO_PAD.encode(digest)
        ))
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool> {
        let mut parts = hash.split('$');
        let (Some(scheme), Some(iterations), Some(salt), Some(digest), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(WorkbenchError::MalformedHash);
        };
        if scheme != HASH_SCHEME {
            return Err(WorkbenchError::MalformedHash);
        }
        let iterations = iterations
            .parse::<u32>()
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or(WorkbenchError::MalformedHash)?;
        let salt = STANDARD_NO_PAD
            .decode(salt)
            .map_err(|_| WorkbenchError::MalformedHash)?;
        let digest = STANDARD_NO_PAD
            .decode(digest)
            .map_err(|_| WorkbenchError::MalformedHash)?;
        if digest.len() != DIGEST_LEN {
            return Err(WorkbenchError::MalformedHash);
        }

        Ok(pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            &salt,
            password.as_bytes(),
            &digest,
        )
        .is_ok())
    }

    /// Alphanumeric token of exactly `length` characters.
    pub fn generate_token(&self, length: usize) -> Result<String> {
        // 248 = 4 * 62, so accepted bytes map uniformly onto the alphabet.
        const LIMIT: u8 = 248;
        let mut token = String::with_capacity(length);
        while token.len() < length {
            for byte in self.random_bytes(length.max(16))? {
                if byte < LIMIT {
                    token.push(char::from(TOKEN_ALPHABET[usize::from(byte) % TOKEN_ALPHABET.len()]));
                    if token.len() == length {
                        break;
                    }
                }
            }
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cipher() -> Cipher {
        Cipher::new(&[7u8; 32], b"mac-key").unwrap().with_pbkdf2_iterations(1_000)
    }

    #[test]
    fn encrypt_roundtrips_with_fresh_nonces() {
        let c = cipher();
        let a = c.encrypt(b"s3cret").unwrap();
        let b = c.encrypt(b"s3cret").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&a).unwrap(), b"s3cret");
        assert_eq!(c.decrypt(&b).unwrap(), b"s3cret");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let c = cipher();
        let ct = c.encrypt(b"").unwrap();
        assert_eq!(c.decrypt(&ct).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn every_flipped_bit_is_detected() {
        let c = cipher();
        let ct = c.encrypt(b"password").unwrap();
        for i in 0..ct.len() {
            for bit in 0..8 {
                let mut bad = ct.clone();
                bad[i] ^= 1 << bit;
                assert_eq!(c.decrypt(&bad), Err(WorkbenchError::TamperDetected));
            }
        }
    }

    #[test]
    fn truncation_and_foreign_keys_are_rejected() {
        let c = cipher();
        let ct = c.encrypt(b"password").unwrap();
        assert_eq!(c.decrypt(&ct[..ct.len() - 1]), Err(WorkbenchError::TamperDetected));
        assert_eq!(c.decrypt(&[]), Err(WorkbenchError::TamperDetected));

        let other = Cipher::new(&[9u8; 32], b"mac-key").unwrap();
        assert_eq!(other.decrypt(&ct), Err(WorkbenchError::TamperDetected));
    }

    #[test]
    fn rejects_short_cipher_key() {
        assert!(matches!(
            Cipher::new(&[1u8; 16], b"mac"),
            Err(WorkbenchError::InputInvalid(_))
        ));
    }

    #[test]
    fn signatures_are_deterministic_and_strict() {
        let c = cipher();
        let sig = c.sign(b"alice");
        assert_eq!(sig, c.sign(b"alice"));
        assert!(c.verify(b"alice", &sig));
        assert!(!c.verify(b"alicf", &sig));

        let mut bad = sig.clone();
        bad[0] ^= 0x01;
        assert!(!c.verify(b"alice", &bad));
        assert!(!c.verify(b"alice", &sig[..sig.len() - 1]));
    }

    #[test]
    fn password_hashes_are_salted() {
        let c = cipher();
        let h1 = c.hash_password("hunter2").unwrap();
        let h2 = c.hash_password("hunter2").unwrap();
        assert_ne!(h1, h2);
        assert!(c.verify_password("hunter2", &h1).unwrap());
        assert!(c.verify_password("hunter2", &h2).unwrap());
        assert!(!c.verify_password("hunter3", &h1).unwrap());
    }

    #[test]
    fn malformed_hashes_are_distinguishable() {
        let c = cipher();
        for bad in [
            "",
            "plain",
            "md5$1$abc$def",
            "pbkdf2_sha256$0$AAAA$AAAA",
            "pbkdf2_sha256$x$AAAA$AAAA",
            "pbkdf2_sha256$10$!!$AAAA",
            "pbkdf2_sha256$10$AAAA$AAAA",
            "pbkdf2_sha256$10$AAAA$AAAA$extra",
        ] {
            assert_eq!(c.verify_password("pw", bad), Err(WorkbenchError::MalformedHash), "{bad}");
        }
    }

    #[test]
    fn tokens_have_exact_length_and_do_not_repeat() {
        let c = cipher();
        assert_eq!(c.generate_token(0).unwrap(), "");
        let mut seen = HashSet::new();
        for len in [1usize, 7, 32, 64, 300] {
            let token = c.generate_token(len).unwrap();
            assert_eq!(token.len(), len);
            assert!(token.bytes().all(|b| b.is_ascii_alphanumeric()));
        }
        for _ in 0..1_000 {
            assert!(seen.insert(c.generate_token(32).unwrap()));
        }
    }
}
