//! Account keys and legacy (EIP-155) transaction signing.

use std::{fmt, str::FromStr};

use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};

use crate::{abi::keccak256, address::Address};

/// Errors handling keys and signatures.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The key is not 32 bytes of hex.
    #[error("private key must be 32 bytes of hex")]
    InvalidKeyEncoding,
    /// The key is not a valid secp256k1 scalar.
    #[error("private key is not a valid secp256k1 key")]
    InvalidKey,
    /// Signing failed.
    #[error("signing failed: {0}")]
    Signature(#[from] k256::ecdsa::Error),
}

/// A secp256k1 private key controlling an account.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Create a key from its 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignerError> {
        SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| SignerError::InvalidKey)
    }

    /// The account address controlled by this key.
    pub fn address(&self) -> Address {
        address_of(self.0.verifying_key())
    }

    /// Sign a 32 byte digest, returning `(r, s, recovery id)`.
    pub fn sign_prehash(&self, digest: &[u8; 32]) -> Result<([u8; 32], [u8; 32], u8), SignerError> {
        let (signature, recovery_id): (Signature, RecoveryId) =
            self.0.sign_prehash_recoverable(digest)?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok((r, s, recovery_id.to_byte()))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({})", self.address())
    }
}

impl FromStr for SecretKey {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| SignerError::InvalidKeyEncoding)?;
        Self::from_bytes(&bytes)
    }
}

fn address_of(key: &VerifyingKey) -> Address {
    let point = key.as_affine().to_encoded_point(false);
    // skip the 0x04 sec1 tag
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; Address::LENGTH];
    bytes.copy_from_slice(&hash[12..]);
    Address::from_bytes(bytes)
}

/// A pre EIP-1559 transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    /// Sender nonce.
    pub nonce: u64,
    /// Gas price in wei.
    pub gas_price: u128,
    /// Gas limit.
    pub gas_limit: u64,
    /// Recipient.
    pub to: Address,
    /// Value in wei.
    pub value: u128,
    /// Call data.
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    fn rlp_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp::uint(self.nonce.into()),
            rlp::uint(self.gas_price),
            rlp::uint(self.gas_limit.into()),
            rlp::bytes(self.to.as_bytes()),
            rlp::uint(self.value),
            rlp::bytes(&self.data),
        ]
    }

    /// The EIP-155 signing payload for `chain_id`.
    pub fn signing_payload(&self, chain_id: u64) -> Vec<u8> {
        let mut fields = self.rlp_fields();
        fields.push(rlp::uint(chain_id.into()));
        fields.push(rlp::uint(0));
        fields.push(rlp::uint(0));
        rlp::list(&fields)
    }

    /// Sign for `chain_id` and return the raw transaction, ready for `eth_sendRawTransaction`.
    pub fn sign(&self, key: &SecretKey, chain_id: u64) -> Result<Vec<u8>, SignerError> {
        let digest = keccak256(self.signing_payload(chain_id));
        let (r, s, recovery_id) = key.sign_prehash(&digest)?;
        let v = u128::from(recovery_id) + u128::from(chain_id) * 2 + 35;
        let mut fields = self.rlp_fields();
        fields.push(rlp::uint(v));
        fields.push(rlp::bytes(strip_leading_zeros(&r)));
        fields.push(rlp::bytes(strip_leading_zeros(&s)));
        Ok(rlp::list(&fields))
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Recursive length prefix encoding, only the pieces transactions need.
mod rlp {
    use super::strip_leading_zeros;

    fn length_prefix(len: usize, short: u8, long: u8) -> Vec<u8> {
        if len <= 55 {
            vec![short + len as u8]
        } else {
            let len_bytes = len.to_be_bytes();
            let len_bytes = strip_leading_zeros(&len_bytes);
            let mut out = vec![long + len_bytes.len() as u8];
            out.extend_from_slice(len_bytes);
            out
        }
    }

    pub(super) fn bytes(data: &[u8]) -> Vec<u8> {
        if data.len() == 1 && data[0] < 0x80 {
            return data.to_vec();
        }
        let mut out = length_prefix(data.len(), 0x80, 0xb7);
        out.extend_from_slice(data);
        out
    }

    pub(super) fn uint(n: u128) -> Vec<u8> {
        bytes(strip_leading_zeros(&n.to_be_bytes()))
    }

    pub(super) fn list(items: &[Vec<u8>]) -> Vec<u8> {
        let payload: Vec<u8> = items.concat();
        let mut out = length_prefix(payload.len(), 0xc0, 0xf7);
        out.extend_from_slice(&payload);
        out
    }
}
