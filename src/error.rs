use thiserror::Error;

/// Error taxonomy surfaced by `ClientState` and `ServerState`.
///
/// Every mutating operation returns one of these kinds rather than panicking;
/// the only exceptions are conditions that are impossible by construction
/// (e.g. a script we just built failing to parse), which abort via
/// [`cannot_happen`].
#[derive(Debug, Error)]
pub enum Error {
    /// A value was negative, would leave a dust output, or overdraws the
    /// channel.
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    /// The wallet could not fund the contract, or the closing payment would
    /// be dust after fees.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// A signature, script, or contract failed to verify, or an expiry
    /// policy was violated.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The operation is not valid in the state machine's current state.
    #[error("illegal state: {0}")]
    IllegalState(#[from] IllegalState),

    /// The broadcaster reported failure for a submitted transaction.
    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

/// Reasons an operation is rejected purely because of which state the
/// machine is currently in.
#[derive(Debug, Error)]
pub enum IllegalState {
    #[error("channel has expired")]
    ChannelExpired,
    #[error("`{operation}` is not valid while in state `{state}`")]
    WrongState {
        operation: &'static str,
        state: String,
    },
    #[error("channel id required but none was provided")]
    MissingChannelId,
}

impl Error {
    pub(crate) fn wrong_state(operation: &'static str, state: impl ToString) -> Self {
        Error::IllegalState(IllegalState::WrongState {
            operation,
            state: state.to_string(),
        })
    }

    pub(crate) fn expired() -> Self {
        Error::IllegalState(IllegalState::ChannelExpired)
    }

    /// Abort on a condition that cannot happen if the rest of this crate is
    /// correct (a transaction or script we just built fails to re-parse).
    /// Kept as a distinct helper, rather than a bare `panic!`, so these sites
    /// are grep-able.
    pub(crate) fn cannot_happen(context: &str) -> ! {
        unreachable!("invariant violated, should be impossible by construction: {context}")
    }
}
