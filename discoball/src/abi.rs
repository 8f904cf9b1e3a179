//! A minimal Solidity ABI codec.
//!
//! Only what the registry contract needs: `address`, `uint256` and `string` arguments, and
//! decoding of those types plus dynamic arrays of tuples from return data and event payloads.
//! `uint256` values are limited to `u64`; larger values are rejected as malformed.

use sha3::{Digest, Keccak256};

use crate::address::Address;

const WORD: usize = 32;

/// Keccak-256 of `data`.
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Keccak256::digest(data.as_ref()).into()
}

/// The 4 byte selector of a function signature such as `transfer(address,uint256)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// The first topic of an event with the given signature.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// A value to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// An `address`.
    Address(Address),
    /// A `uint256`.
    Uint(u64),
    /// A `string`.
    String(&'a str),
}

/// Errors decoding ABI data.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AbiError {
    /// A read past the end of the data.
    #[error("read of {len} bytes at {offset} is out of bounds")]
    OutOfBounds {
        /// Start of the read.
        offset: usize,
        /// Number of bytes read.
        len: usize,
    },
    /// An integer that does not fit the target type.
    #[error("integer at {0} does not fit in 64 bits")]
    Overflow(usize),
    /// An address word with non-zero padding.
    #[error("invalid address word at {0}")]
    InvalidAddress(usize),
    /// A string that is not valid utf-8.
    #[error("string at {0} is not valid utf-8")]
    InvalidUtf8(usize),
}

fn uint_word(n: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&n.to_be_bytes());
    word
}

fn address_word(address: &Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - Address::LENGTH..].copy_from_slice(address.as_bytes());
    word
}

/// Encode `tokens` as a tuple, the way call arguments and non-indexed event fields are laid out.
pub fn encode(tokens: &[Token<'_>]) -> Vec<u8> {
    let head_len = tokens.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();
    for token in tokens {
        match token {
            Token::Address(address) => head.extend_from_slice(&address_word(address)),
            Token::Uint(n) => head.extend_from_slice(&uint_word(*n)),
            Token::String(s) => {
                head.extend_from_slice(&uint_word((head_len + tail.len()) as u64));
                tail.extend_from_slice(&uint_word(s.len() as u64));
                tail.extend_from_slice(s.as_bytes());
                let padding = (WORD - s.len() % WORD) % WORD;
                tail.resize(tail.len() + padding, 0);
            }
        }
    }
    head.extend_from_slice(&tail);
    head
}

/// Encode a call to the function with the given signature.
pub fn encode_call(signature: &str, tokens: &[Token<'_>]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&encode(tokens));
    data
}

/// Random access reader over ABI encoded data.
///
/// All positions are absolute byte offsets into the data. Offsets stored inside the data are
/// relative to the start of the enclosing tuple, which callers pass as `base`.
#[derive(Debug, Clone, Copy)]
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Wrap `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], AbiError> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(AbiError::OutOfBounds { offset, len })
    }

    /// Read a `uint256` at `at`.
    pub fn uint(&self, at: usize) -> Result<u64, AbiError> {
        let word = self.slice(at, WORD)?;
        if word[..WORD - 8].iter().any(|b| *b != 0) {
            return Err(AbiError::Overflow(at));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&word[WORD - 8..]);
        Ok(u64::from_be_bytes(bytes))
    }

    /// Read the offset stored at `at`, resolved against `base`.
    pub fn offset(&self, at: usize, base: usize) -> Result<usize, AbiError> {
        let relative = usize::try_from(self.uint(at)?).map_err(|_| AbiError::Overflow(at))?;
        base.checked_add(relative).ok_or(AbiError::Overflow(at))
    }

    /// Read an `address` at `at`.
    pub fn address(&self, at: usize) -> Result<Address, AbiError> {
        let word = self.slice(at, WORD)?;
        if word[..WORD - Address::LENGTH].iter().any(|b| *b != 0) {
            return Err(AbiError::InvalidAddress(at));
        }
        let mut bytes = [0u8; Address::LENGTH];
        bytes.copy_from_slice(&word[WORD - Address::LENGTH..]);
        Ok(Address::from_bytes(bytes))
    }

    /// Read a `string` whose offset is stored at `at`, relative to `base`.
    pub fn string(&self, at: usize, base: usize) -> Result<String, AbiError> {
        let start = self.offset(at, base)?;
        let len = usize::try_from(self.uint(start)?).map_err(|_| AbiError::Overflow(start))?;
        let bytes = self.slice(start + WORD, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| AbiError::InvalidUtf8(start))
    }

    /// Read a dynamic array whose offset is stored at `at`, relative to `base`.
    ///
    /// Returns the number of elements and the position where the element heads start, which
    /// is also the base for offsets of dynamic elements.
    pub fn array(&self, at: usize, base: usize) -> Result<(usize, usize), AbiError> {
        let start = self.offset(at, base)?;
        let len = usize::try_from(self.uint(start)?).map_err(|_| AbiError::Overflow(start))?;
        let heads = start + WORD;
        // every element needs at least one head word
        self.slice(heads, len.checked_mul(WORD).ok_or(AbiError::Overflow(start))?)?;
        Ok((len, heads))
    }
}

/// The size of one ABI word.
pub const WORD_SIZE: usize = WORD;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_vectors() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn encode_string() {
        let data = encode(&[Token::String("hello")]);
        let expected = concat!(
            "0000000000000000000000000000000000000000000000000000000000000020",
            "0000000000000000000000000000000000000000000000000000000000000005",
            "68656c6c6f000000000000000000000000000000000000000000000000000000",
        );
        assert_eq!(hex::encode(data), expected);
    }

    #[test]
    fn decode_mixed_tuple() {
        let publisher: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        let data = encode(&[
            Token::Address(publisher),
            Token::String("QmHash"),
            Token::String("a description that is longer than one word of data"),
            Token::Uint(42),
        ]);
        let d = Decoder::new(&data);
        assert_eq!(d.address(0).unwrap(), publisher);
        assert_eq!(d.string(32, 0).unwrap(), "QmHash");
        assert_eq!(
            d.string(64, 0).unwrap(),
            "a description that is longer than one word of data"
        );
        assert_eq!(d.uint(96).unwrap(), 42);
    }

    #[test]
    fn decode_errors() {
        let data = encode(&[Token::Uint(7)]);
        let d = Decoder::new(&data);
        assert_eq!(
            d.uint(32),
            Err(AbiError::OutOfBounds {
                offset: 32,
                len: 32
            })
        );
        let mut big = [0u8; 32];
        big[0] = 1;
        assert_eq!(Decoder::new(&big).uint(0), Err(AbiError::Overflow(0)));
        assert_eq!(
            Decoder::new(&big).address(0),
            Err(AbiError::InvalidAddress(0))
        );
        // string offset pointing past the end
        assert!(Decoder::new(&data).string(0, 0).is_err());
    }
}
