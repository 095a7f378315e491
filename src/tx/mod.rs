pub mod payment;
pub mod refund;
pub mod sign;

pub use payment::{append_server_output, build_unsigned_payment};
pub use refund::{build_unsigned_refund, is_well_formed_refund_shape};
pub use sign::{
    assemble_multisig_script_sig, extract_multisig_signatures, sign_input, split_signature,
    verify_input,
};
