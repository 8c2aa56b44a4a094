//! RSA decryption of the secure login block
//!
//! The client raises the secure block to the public exponent; the server
//! recovers it with raw modular exponentiation. No padding scheme is used.

use std::fmt;

use anyhow::{Context, Result};
use num_bigint::BigUint;

use crate::error::ProtocolError;

/// Private half of the login key
#[derive(Clone)]
pub struct LoginKey {
    modulus: BigUint,
    private_exponent: BigUint,
}

impl LoginKey {
    /// Parse the key from hex strings as found in the server config
    pub fn from_hex(modulus: &str, private_exponent: &str) -> Result<Self> {
        let modulus = BigUint::parse_bytes(modulus.trim().as_bytes(), 16)
            .context("Failed to parse RSA modulus")?;
        let private_exponent = BigUint::parse_bytes(private_exponent.trim().as_bytes(), 16)
            .context("Failed to parse RSA private exponent")?;

        if modulus.bits() < 64 {
            anyhow::bail!("RSA modulus is too small ({} bits)", modulus.bits());
        }

        Ok(Self {
            modulus,
            private_exponent,
        })
    }

    pub fn from_parts(modulus: BigUint, private_exponent: BigUint) -> Self {
        Self {
            modulus,
            private_exponent,
        }
    }

    pub fn bits(&self) -> u64 {
        self.modulus.bits()
    }

    /// Decrypt a secure block (big-endian integer)
    pub fn decrypt(&self, block: &[u8]) -> std::result::Result<Vec<u8>, ProtocolError> {
        if block.is_empty() {
            return Err(ProtocolError::RsaDecryptionFailed);
        }
        let cipher = BigUint::from_bytes_be(block);
        if cipher >= self.modulus {
            return Err(ProtocolError::RsaDecryptionFailed);
        }
        Ok(cipher
            .modpow(&self.private_exponent, &self.modulus)
            .to_bytes_be())
    }
}

impl fmt::Debug for LoginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the private exponent
        f.debug_struct("LoginKey")
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}
