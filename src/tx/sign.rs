//! Legacy (pre-segwit) ECDSA signing and verification for a single
//! multisig input, shared by both `ClientState` and `ServerState`.
//!
//! Every signature produced here is a DER-encoded ECDSA signature with a
//! one-byte sighash-flag suffix (spec.md §6), computed over the legacy
//! (`SIGHASH`) digest of the input rather than the BIP143 segwit digest,
//! since the multisig output itself is a bare (non-witness) script.

use bitcoin::hashes::Hash;
use bitcoin::script::Script;
use bitcoin::secp256k1::ecdsa::Signature as EcdsaSignature;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, Transaction};

use crate::error::Error;

/// Signs `tx`'s input at `input_index`, spending `script_code`, with
/// `key` under `sighash_type`. Returns the DER signature with the
/// sighash-flag byte appended, ready to drop into a `script_sig`.
pub fn sign_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    key: &SecretKey,
    sighash_type: EcdsaSighashType,
) -> Vec<u8> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(input_index, script_code, sighash_type.to_u32())
        .unwrap_or_else(|_| Error::cannot_happen("legacy sighash over a well-formed input"));
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_ecdsa(&msg, key);

    let mut bytes = sig.serialize_der().to_vec();
    bytes.push(sighash_type.to_u32() as u8);
    bytes
}

/// Splits a `<der><sighash-byte>` signature into its signature and mode.
pub fn split_signature(sig_bytes: &[u8]) -> Result<(EcdsaSignature, EcdsaSighashType), Error> {
    let (der, flag) = sig_bytes
        .split_last()
        .ok_or_else(|| Error::Verification("empty signature".into()))?;
    let sighash_type = EcdsaSighashType::from_consensus(*flag as u32);
    let sig = EcdsaSignature::from_der(der)
        .map_err(|e| Error::Verification(format!("malformed DER signature: {e}")))?;
    Ok((sig, sighash_type))
}

/// Verifies `sig_bytes` over `tx`'s input at `input_index`, spending
/// `script_code`, under `pubkey`. Returns the sighash mode the signature
/// actually carries so the caller can check it against the mode the
/// protocol requires for this step.
pub fn verify_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    pubkey: &PublicKey,
    sig_bytes: &[u8],
) -> Result<EcdsaSighashType, Error> {
    let (sig, sighash_type) = split_signature(sig_bytes)?;

    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(input_index, script_code, sighash_type.to_u32())
        .map_err(|e| Error::Verification(format!("cannot compute sighash for input: {e}")))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    secp.verify_ecdsa(&msg, &sig, &pubkey.inner)
        .map_err(|_| Error::Verification("signature does not verify under the given key".into()))?;

    Ok(sighash_type)
}

/// Assembles the multisig `script_sig` from both signatures, in the same
/// client-first order the multisig output itself uses. `OP_CHECKMULTISIG`'s
/// famous off-by-one bug requires a leading dummy element.
pub fn assemble_multisig_script_sig(client_sig: &[u8], server_sig: &[u8]) -> bitcoin::ScriptBuf {
    use bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0;
    use bitcoin::script::{Builder, PushBytesBuf};

    let client_push = PushBytesBuf::try_from(client_sig.to_vec())
        .unwrap_or_else(|_| Error::cannot_happen("signature exceeds max push size"));
    let server_push = PushBytesBuf::try_from(server_sig.to_vec())
        .unwrap_or_else(|_| Error::cannot_happen("signature exceeds max push size"));

    Builder::new()
        .push_opcode(OP_PUSHBYTES_0)
        .push_slice(&client_push)
        .push_slice(&server_push)
        .into_script()
}

/// Parses a `script_sig` built by [`assemble_multisig_script_sig`] back into
/// its two signatures, so a transaction this crate did not itself construct
/// (e.g. the server's broadcast close, or an unexpected incoming spend) can
/// still be verified.
pub fn extract_multisig_signatures(script_sig: &Script) -> Option<(Vec<u8>, Vec<u8>)> {
    use bitcoin::script::Instruction;

    let pushes: Vec<Vec<u8>> = script_sig
        .instructions()
        .filter_map(|i| match i {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect();

    // [dummy OP_0 push, client signature, server signature]
    if pushes.len() != 3 {
        return None;
    }
    Some((pushes[1].clone(), pushes[2].clone()))
}
