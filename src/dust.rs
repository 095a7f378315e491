//! Symbolic constants the transaction layer depends on.
//!
//! `spec.md` references `MIN_NONDUST_OUTPUT` and `REFERENCE_DEFAULT_MIN_TX_FEE`
//! without pinning numeric values, noting they belong to "the transaction
//! layer". A compiling crate has to pin something; these match Bitcoin
//! Core's own dust-relay and `DEFAULT_MIN_RELAY_TX_FEE` constants.

use bitcoin::Amount;

/// Smallest output value the network will relay/mine. Below this, an output
/// is not worth the UTXO-set space it would occupy.
pub const MIN_NONDUST_OUTPUT: Amount = Amount::from_sat(546);

/// Default fee taken from the refund path when the refund value is below
/// `CENT` (spec.md §4.1).
pub const REFERENCE_DEFAULT_MIN_TX_FEE: Amount = Amount::from_sat(1_000);

/// One "cent": a hundredth of a bitcoin, the threshold spec.md §4.1 uses to
/// decide whether the refund pays a fee out of its own value.
pub const CENT: Amount = Amount::from_sat(1_000_000);

/// Confirmation depth after which a settlement is considered permanent
/// (spec.md glossary: "event horizon").
pub const EVENT_HORIZON_CONFIRMATIONS: u32 = 6;

/// `true` if an output of this value would be unspendable in practice.
pub fn is_dust(value: Amount) -> bool {
    value < MIN_NONDUST_OUTPUT
}
