//! Password generation for provisioned users

use crate::error::{OperatorError, Result};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::SecretString;

/// Characters a generated password is drawn from
pub const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-_=+";

/// Default length of generated passwords
pub const DEFAULT_PASSWORD_LENGTH: usize = 32;

/// Bounds accepted for the configured password length
pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Generates passwords from the system CSPRNG
#[derive(Debug)]
pub struct PasswordGenerator {
    length: usize,
    rng: SystemRandom,
}

impl Default for PasswordGenerator {
    fn default() -> Self {
        Self {
            length: DEFAULT_PASSWORD_LENGTH,
            rng: SystemRandom::new(),
        }
    }
}

impl PasswordGenerator {
    /// Create a generator producing passwords of `length` characters
    pub fn new(length: usize) -> Result<Self> {
        if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&length) {
            return Err(OperatorError::InvalidConfig(format!(
                "password length must be between {} and {}, got {}",
                MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH, length
            )));
        }
        Ok(Self {
            length,
            rng: SystemRandom::new(),
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Generate a fresh password
    ///
    /// Bytes at or above the largest multiple of the alphabet size are
    /// discarded so every character is equally likely.
    pub fn generate(&self) -> Result<SecretString> {
        let alphabet_len = PASSWORD_ALPHABET.len();
        let limit = 256 - (256 % alphabet_len);

        let mut password = String::with_capacity(self.length);
        let mut buf = [0u8; 64];

        while password.len() < self.length {
            self.rng.fill(&mut buf)?;

            for &byte in buf.iter() {
                if (byte as usize) >= limit {
                    continue;
                }
                password.push(PASSWORD_ALPHABET[byte as usize % alphabet_len] as char);
                if password.len() == self.length {
                    break;
                }
            }
        }

        Ok(SecretString::from(password))
    }
}
