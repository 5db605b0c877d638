//! Receiving wallet and on-chain identifier parsing.
//!
//! The gateway never holds keys. It only needs to know the address that
//! payments must be sent to, plus strongly typed EVM addresses and
//! transaction hashes for comparing transfer logs.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 20-byte EVM account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvmAddress([u8; 20]);

impl EvmAddress {
    /// Wrap raw address bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The address left-padded to a 32-byte log topic, `0x`-prefixed.
    #[must_use]
    pub fn to_topic(&self) -> String {
        format!("0x{}{}", "0".repeat(24), hex::encode(self.0))
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for EvmAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_address(s)
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_address(&s).map_err(serde::de::Error::custom)
    }
}

/// A 32-byte transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash([u8; 32]);

impl TxHash {
    /// Wrap raw hash bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for TxHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_tx_hash(s)
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_tx_hash(&s).map_err(serde::de::Error::custom)
    }
}

/// Decode a `0x`-prefixed hex string of exactly `N` bytes.
fn decode_prefixed_hex<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let hex_part = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| {
            Error::InvalidPaymentProof(format!("{what} must start with '0x', got: {value}"))
        })?;

    if hex_part.len() != N * 2 {
        return Err(Error::InvalidPaymentProof(format!(
            "{what} must be {} hex characters, got {}",
            N * 2,
            hex_part.len()
        )));
    }

    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidPaymentProof(format!(
            "{what} contains non-hex characters: {value}"
        )));
    }

    let bytes = hex::decode(hex_part)
        .map_err(|e| Error::InvalidPaymentProof(format!("failed to decode {what}: {e}")))?;

    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Parse an EVM address string (`0x` + 40 hex characters, any case).
///
/// # Errors
///
/// Returns an error if the address format is invalid.
pub fn parse_address(address: &str) -> Result<EvmAddress> {
    decode_prefixed_hex::<20>(address.trim(), "address").map(EvmAddress)
}

/// Parse a transaction hash string (`0x` + 64 hex characters, any case).
///
/// # Errors
///
/// Returns an error if the hash format is invalid.
pub fn parse_tx_hash(hash: &str) -> Result<TxHash> {
    decode_prefixed_hex::<32>(hash.trim(), "transaction id").map(TxHash)
}

/// Validate that an EVM address is properly formatted.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}

/// Source of the address payments must be sent to.
///
/// Resolved once per process by the gateway.
#[async_trait]
pub trait ReceivingWallet: Send + Sync {
    /// The service's receiving address.
    ///
    /// # Errors
    ///
    /// Returns an error if the wallet collaborator cannot be reached.
    async fn receiving_address(&self) -> Result<EvmAddress>;
}

/// Wallet backed by a configured address.
#[derive(Debug, Clone)]
pub struct StaticWallet {
    address: EvmAddress,
}

impl StaticWallet {
    /// Wrap a known address.
    #[must_use]
    pub fn new(address: EvmAddress) -> Self {
        Self { address }
    }

    /// Build from an optional configured address string.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the address is missing or malformed.
    pub fn from_config(address: Option<&str>) -> Result<Self> {
        let raw = address
            .ok_or_else(|| Error::Config("payment.payee_address is not set".to_string()))?;
        let address =
            parse_address(raw).map_err(|e| Error::Config(format!("payment.payee_address: {e}")))?;
        Ok(Self { address })
    }
}

#[async_trait]
impl ReceivingWallet for StaticWallet {
    async fn receiving_address(&self) -> Result<EvmAddress> {
        Ok(self.address)
    }
}
