//! Time-boxed skill payloads.
//!
//! A payload is `base64(iv || AES-256-CBC-PKCS7(source))`. The key is
//! `SHA-256(secret || totp(secret, t))`, so a payload only opens within a few
//! 30-second steps of the moment it was sealed.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use sisypho_core::config::SkillsConfig;
use sisypho_core::{Error, Result};
use tracing::{debug, warn};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type HmacSha1 = Hmac<sha1::Sha1>;

pub const TOTP_STEP_SECS: i64 = 30;
const TOTP_DIGITS: u32 = 6;
const IV_LEN: usize = 16;

/// Seals and opens skill payloads with a shared base32 secret.
#[derive(Debug, Clone)]
pub struct SkillCipher {
    secret: String,
    secret_bytes: Vec<u8>,
    steps_back: u32,
    steps_forward: u32,
}

impl SkillCipher {
    pub fn new(secret: &str) -> Result<Self> {
        let normalized = secret.trim().trim_end_matches('=').to_ascii_uppercase();
        let secret_bytes = data_encoding::BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|e| Error::Crypto(format!("secret is not valid base32: {}", e)))?;
        Ok(Self {
            secret: secret.to_string(),
            secret_bytes,
            steps_back: 2,
            steps_forward: 4,
        })
    }

    pub fn from_config(config: &SkillsConfig) -> Result<Self> {
        Ok(Self::new(&config.secret)?.with_window(config.steps_back, config.steps_forward))
    }

    /// How many 30 s steps before and after the given time `decrypt` tries.
    pub fn with_window(mut self, steps_back: u32, steps_forward: u32) -> Self {
        self.steps_back = steps_back;
        self.steps_forward = steps_forward;
        self
    }

    /// RFC 6238 code (HMAC-SHA1, 6 digits) for the step containing `timestamp`.
    pub fn totp(&self, timestamp: i64) -> Result<String> {
        let counter = (timestamp.max(0) / TOTP_STEP_SECS) as u64;
        let mut mac = HmacSha1::new_from_slice(&self.secret_bytes)
            .map_err(|e| Error::Crypto(format!("bad TOTP key: {}", e)))?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        let code = binary % 10u32.pow(TOTP_DIGITS);
        Ok(format!("{:0width$}", code, width = TOTP_DIGITS as usize))
    }

    fn key_at(&self, timestamp: i64) -> Result<[u8; 32]> {
        let code = self.totp(timestamp)?;
        Ok(Sha256::digest(format!("{}{}", self.secret, code).as_bytes()).into())
    }

    /// Seal `plaintext` for the step containing `timestamp` with a random IV.
    pub fn encrypt(&self, plaintext: &str, timestamp: i64) -> Result<String> {
        self.encrypt_with_iv(plaintext, timestamp, *uuid::Uuid::new_v4().as_bytes())
    }

    pub fn encrypt_with_iv(&self, plaintext: &str, timestamp: i64, iv: [u8; IV_LEN]) -> Result<String> {
        let key = self.key_at(timestamp)?;
        let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        let mut raw = iv.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(B64.encode(raw))
    }

    /// Try each step offset from `-steps_back` to `+steps_forward` in order and
    /// return the first plaintext whose padding and UTF-8 both check out.
    pub fn decrypt(&self, payload: &str, timestamp: i64) -> Option<String> {
        let raw = match B64.decode(payload.trim()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Skill payload is not base64");
                return None;
            }
        };
        if raw.len() < IV_LEN * 2 || (raw.len() - IV_LEN) % IV_LEN != 0 {
            warn!(len = raw.len(), "Skill payload has an impossible length");
            return None;
        }
        let (iv, ciphertext) = raw.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().ok()?;

        let back = -(self.steps_back as i64);
        let forward = self.steps_forward as i64;
        for step in back..=forward {
            let at = timestamp + step * TOTP_STEP_SECS;
            let Ok(key) = self.key_at(at) else {
                continue;
            };
            let opened = Aes256CbcDec::new(&key.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match opened {
                Some(plaintext) => {
                    debug!(offset_secs = step * TOTP_STEP_SECS, "Skill payload opened");
                    return Some(plaintext);
                }
                None => debug!(offset_secs = step * TOTP_STEP_SECS, "Offset rejected"),
            }
        }
        warn!("No step offset opened the skill payload");
        None
    }
}
