//! Construction of the 2-of-2 multisig output shared by the contract,
//! refund, and payment transactions.

use bitcoin::blockdata::opcodes::all as opcodes;
use bitcoin::script::{Builder, ScriptBuf};
use bitcoin::PublicKey;

use crate::error::Error;

/// The P2PKH script a public key's refund/payment output pays to.
///
/// Both sides must be able to reconstruct this script from nothing but the
/// other party's public key (spec.md §4.2: "the client address derivable
/// from client_pub"), so it is a pure function of the key rather than an
/// address fetched from a wallet — the scriptPubKey bytes of a P2PKH output
/// don't depend on network, only the base58 address string would.
pub fn payment_script_for_pubkey(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&pubkey.pubkey_hash())
}

/// Builds the channel's multisig output script.
///
/// Unlike a BOLT3-style funding script, key order here is *not* sorted
/// lexicographically: spec.md §6 fixes it as client-first, server-second,
/// and §3 invariant 5 requires the contract's script to list `client_pub`
/// before `server_pub`. Any other order is a protocol error, not merely a
/// style choice, since both refund and payment signatures commit to this
/// exact script.
pub struct ContractBuilder;

impl ContractBuilder {
    /// `OP_2 <client_pub> <server_pub> OP_2 OP_CHECKMULTISIG`, a bare
    /// (non-P2SH, non-P2WSH) multisig output, matching the legacy
    /// pre-segwit design this protocol uses throughout (see SPEC_FULL.md §4).
    pub fn multisig_script(client_pub: &PublicKey, server_pub: &PublicKey) -> ScriptBuf {
        Builder::new()
            .push_int(2)
            .push_key(client_pub)
            .push_key(server_pub)
            .push_int(2)
            .push_opcode(opcodes::OP_CHECKMULTISIG)
            .into_script()
    }

    /// Validates that both public keys are in canonical (compressed) form.
    /// A channel built from uncompressed keys would still be spendable but
    /// would not match what every other implementation of this protocol
    /// produces for the same inputs, so it's rejected early.
    pub fn validate_canonical_keys(client_pub: &PublicKey, server_pub: &PublicKey) -> Result<(), Error> {
        if !client_pub.compressed || !server_pub.compressed {
            return Err(Error::Verification(
                "multisig public keys must be in compressed form".into(),
            ));
        }
        Ok(())
    }

    /// Re-derives the multisig script and checks it matches what's actually
    /// in `candidate`, in the fixed client-first order. Used by both sides
    /// to confirm a contract or refund they didn't build themselves spends
    /// the output they expect.
    pub fn script_matches(
        candidate: &ScriptBuf,
        client_pub: &PublicKey,
        server_pub: &PublicKey,
    ) -> bool {
        candidate == &Self::multisig_script(client_pub, server_pub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_keys() -> (PublicKey, PublicKey) {
        let secp = Secp256k1::new();
        let client_sk = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let server_sk = SecretKey::from_slice(&[0x22; 32]).unwrap();
        (
            PublicKey::new(client_sk.public_key(&secp)),
            PublicKey::new(server_sk.public_key(&secp)),
        )
    }

    #[test]
    fn client_key_is_pushed_before_server_key() {
        let (client_pub, server_pub) = test_keys();
        let script = ContractBuilder::multisig_script(&client_pub, &server_pub);
        let bytes = script.as_bytes();

        let client_ser = client_pub.to_bytes();
        let server_ser = server_pub.to_bytes();
        let client_pos = bytes
            .windows(client_ser.len())
            .position(|w| w == client_ser.as_slice())
            .expect("client pubkey present");
        let server_pos = bytes
            .windows(server_ser.len())
            .position(|w| w == server_ser.as_slice())
            .expect("server pubkey present");
        assert!(client_pos < server_pos, "client key must precede server key");
    }

    #[test]
    fn script_matches_is_order_sensitive() {
        let (client_pub, server_pub) = test_keys();
        let script = ContractBuilder::multisig_script(&client_pub, &server_pub);
        assert!(ContractBuilder::script_matches(&script, &client_pub, &server_pub));
        assert!(!ContractBuilder::script_matches(&script, &server_pub, &client_pub));
    }
}
