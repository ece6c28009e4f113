//! Core type definitions for the NMX engine

use crate::authorization::SigningAccount;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Token amount in the smallest unit (18 decimals for NMX)
pub type Amount = u128;

/// Logical time: wall-clock seconds or block index, never mixed within one deployment
pub type Timestamp = u64;

/// Per-owner signature counter
pub type Nonce = u64;

/// Network id used in typed-data domains
pub type ChainId = u64;

/// Address - 20-byte account or contract identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    /// Zero address
    pub const ZERO: Self = Self([0u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Deterministic address for a human-readable label (simulations, scenarios)
    pub fn from_label(label: &str) -> Self {
        let hash = blake3::hash(label.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash.as_bytes()[12..]);
        Self(bytes)
    }

    /// Address controlled by an ed25519 public key: last 20 bytes of BLAKE3(pubkey)
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let hash = blake3::hash(public_key);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash.as_bytes()[12..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Hex with 0x prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse from hex, with or without 0x prefix
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Left-padded 32-byte word, as addresses are laid out in typed-data encoding
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..10])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    /// Accepts `0x`-prefixed hex, `signer:<label>` for the key of
    /// [`SigningAccount::from_label`], or any other string as a label
    /// (see [`Address::from_label`])
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.starts_with("0x") {
            Self::from_hex(&s).map_err(serde::de::Error::custom)
        } else if let Some(label) = s.strip_prefix("signer:") {
            Ok(SigningAccount::from_label(label).address())
        } else {
            Ok(Self::from_label(&s))
        }
    }
}

/// Tokens are identified by their contract address
pub type TokenId = Address;

/// The native value asset (ETH/BNB equivalent)
pub const NATIVE_TOKEN: TokenId = Address::ZERO;

/// Encode an integer as a big-endian 32-byte word
pub fn u128_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Parse an amount written as an integer with an optional exponent: `"42"`, `"10e18"`,
/// `"1.5e18"`. The result must be a whole number of base units.
pub fn parse_amount(s: &str) -> Option<Amount> {
    let s = s.trim().replace('_', "");
    let (mantissa, exponent) = match s.split_once(['e', 'E']) {
        Some((m, e)) => (m.to_string(), e.parse::<u32>().ok()?),
        None => (s.clone(), 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa.as_str(), ""));
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.len() as u32 > exponent {
        return None;
    }
    let digits = format!("{int_part}{frac_part}");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let scale = 10u128.checked_pow(exponent - frac_part.len() as u32)?;
    digits.parse::<u128>().ok()?.checked_mul(scale)
}

/// Serde adapter writing amounts as decimal strings (TOML has no 128-bit integers)
pub mod amount_serde {
    use super::{parse_amount, Amount};
    use serde::{de, Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        struct AmountVisitor;

        impl<'de> de::Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an amount as integer or string such as \"10e18\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(v as Amount)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                u128::try_from(v).map_err(|_| E::custom("INVALID_ARGUMENT"))
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
                Ok(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                parse_amount(v).ok_or_else(|| E::custom(format!("invalid amount: {v}")))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}
