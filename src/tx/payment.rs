//! The repeatedly re-signed payment transaction (spec.md §3, §4.1, §4.2).
//!
//! Only ever one version of this transaction is ever broadcast (the one the
//! server picks at `close()`); every earlier version exists only as a
//! signature exchanged between the two parties.

use bitcoin::locktime::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

/// Builds the unsigned payment transaction as the client would: one input
/// spending the multisig output, one output of `value_to_client` paying the
/// client's change address. The server appends its own output only when
/// finalizing the close.
pub fn build_unsigned_payment(
    contract_outpoint: OutPoint,
    value_to_client: Amount,
    client_script_pubkey: ScriptBuf,
) -> Transaction {
    let mut output = Vec::with_capacity(1);
    if value_to_client > Amount::ZERO {
        output.push(TxOut {
            value: value_to_client,
            script_pubkey: client_script_pubkey,
        });
    }

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: contract_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    }
}

/// Appends the server's own output to an already-built client payment
/// transaction, producing the transaction the server finalizes at close.
pub fn append_server_output(mut tx: Transaction, value_to_server: Amount, server_script_pubkey: ScriptBuf) -> Transaction {
    tx.output.push(TxOut {
        value: value_to_server,
        script_pubkey: server_script_pubkey,
    });
    tx
}
