//! Persisted channel records (spec.md §3 "Records", §6 "Persistence").

use bitcoin::{Amount, Transaction};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque key under which a channel's record is stored. Generated randomly
/// by the side that creates the record unless the caller supplies its own.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        ChannelId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.to_hex())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The client's view of a channel, as handed to the wallet extension once
/// the refund has been countersigned (spec.md §3 invariant 6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredClientChannel {
    pub id: ChannelId,
    pub major_version: u8,
    pub contract: Transaction,
    pub refund: Transaction,
    #[serde(with = "secret_key_hex")]
    pub client_key: bitcoin::secp256k1::SecretKey,
    pub value_to_client: Amount,
    pub refund_fees: Amount,
    pub active: bool,
    pub close_tx: Option<Transaction>,
}

/// The server's view of a channel: what it will broadcast at close if
/// nothing better arrives first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredServerChannel {
    pub id: ChannelId,
    pub major_version: u8,
    #[serde(with = "secret_key_hex")]
    pub server_key: bitcoin::secp256k1::SecretKey,
    pub best_value_to_server: Amount,
    pub best_value_signature: Option<Vec<u8>>,
    pub contract: Transaction,
    pub close_tx: Option<Transaction>,
}

/// `SecretKey` has no built-in `serde` round trip via this crate's chosen
/// `bitcoin`/`secp256k1` feature set, so store it as hex, matching how the
/// rest of this crate already hex-encodes signatures and ids.
mod secret_key_hex {
    use bitcoin::secp256k1::SecretKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &SecretKey, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(key.secret_bytes()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecretKey, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        SecretKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
