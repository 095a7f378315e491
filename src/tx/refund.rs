//! The time-locked refund transaction (spec.md §3, §4.1, §4.2).

use bitcoin::locktime::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

/// Builds the unsigned refund transaction: one input spending the
/// multisig output, sequence 0 (non-final, so the time lock is honored),
/// one output of `refund_value` back to the client, `lock_time = expiry_time`.
pub fn build_unsigned_refund(
    contract_outpoint: OutPoint,
    refund_value: Amount,
    client_script_pubkey: ScriptBuf,
    expiry_time: u32,
) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(expiry_time),
        input: vec![TxIn {
            previous_output: contract_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: refund_value,
            script_pubkey: client_script_pubkey,
        }],
    }
}

/// Invariant 4 of spec.md §3: the refund's lock time and sole input's
/// sequence number.
pub fn is_well_formed_refund_shape(tx: &Transaction, expiry_time: u32) -> bool {
    tx.input.len() == 1
        && tx.output.len() == 1
        && tx.lock_time == LockTime::from_consensus(expiry_time)
        && tx.input[0].sequence == Sequence::ZERO
}
