//! The payee's side of the channel (spec.md §4.2).

use std::fmt;
use std::sync::Arc;

use bitcoin::secp256k1::{All, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Amount, OutPoint, PublicKey, Sequence, Transaction};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::collaborators::{Broadcaster, ChannelStore, Wallet};
use crate::contract::{payment_script_for_pubkey, ContractBuilder};
use crate::dust::{self, REFERENCE_DEFAULT_MIN_TX_FEE};
use crate::error::Error;
use crate::store::{ChannelId, StoredServerChannel};
use crate::tx;

/// The payee's lifecycle (spec.md §4.2 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerChannelState {
    New,
    WaitingForMultisigContract,
    WaitingForMultisigAcceptance,
    Ready,
    Closing,
    Closed,
    ErrorClosed,
}

impl fmt::Display for ServerChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

struct ServerInner {
    state: ServerChannelState,
    id: Option<ChannelId>,
    major_version: u8,
    server_key: SecretKey,
    server_pub: PublicKey,
    client_pub: Option<PublicKey>,
    min_expire_time: u32,
    total_value: Amount,
    contract_outpoint: Option<OutPoint>,
    multisig_contract: Option<Transaction>,
    best_value_to_server: Amount,
    best_value_signature: Option<Vec<u8>>,
    close_tx: Option<Transaction>,
}

impl ServerInner {
    fn multisig_script(&self, client_pub: &PublicKey) -> bitcoin::ScriptBuf {
        ContractBuilder::multisig_script(client_pub, &self.server_pub)
    }

    fn require_state(&self, operation: &'static str, allowed: &[ServerChannelState]) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::wrong_state(operation, self.state))
        }
    }
}

/// Countersigns the client's refund; accepts and broadcasts the contract;
/// validates each incoming payment signature, keeping only the best one
/// seen; settles by broadcasting it.
///
/// Generic over its collaborators for the same reason [`crate::client::ClientState`]
/// is: a fixed relationship for the channel's lifetime, resolved statically.
pub struct ServerState<W, S, B>
where
    W: Wallet,
    S: ChannelStore<StoredServerChannel>,
    B: Broadcaster,
{
    wallet: Arc<W>,
    store: Arc<S>,
    broadcaster: Arc<B>,
    secp: Secp256k1<All>,
    inner: Mutex<ServerInner>,
}

impl<W, S, B> ServerState<W, S, B>
where
    W: Wallet,
    S: ChannelStore<StoredServerChannel>,
    B: Broadcaster,
{
    /// `min_expire_time` is the earliest refund lock time this server will
    /// accept; a fresh `server_key` is expected per channel (spec.md §3:
    /// "must not be reused elsewhere").
    pub fn new(
        wallet: Arc<W>,
        store: Arc<S>,
        broadcaster: Arc<B>,
        server_key: SecretKey,
        min_expire_time: u32,
    ) -> Self {
        let secp = Secp256k1::new();
        let server_pub = PublicKey::new(Secp256k1PublicKey::from_secret_key(&secp, &server_key));

        ServerState {
            wallet,
            store,
            broadcaster,
            secp,
            inner: Mutex::new(ServerInner {
                state: ServerChannelState::New,
                id: None,
                major_version: 1,
                server_key,
                server_pub,
                client_pub: None,
                min_expire_time,
                total_value: Amount::ZERO,
                contract_outpoint: None,
                multisig_contract: None,
                best_value_to_server: Amount::ZERO,
                best_value_signature: None,
                close_tx: None,
            }),
        }
    }

    /// Validates the client's unsigned refund and countersigns it with
    /// `NONE|ANYONECANPAY`, binding the server to nothing but this one
    /// input.
    pub async fn provide_refund_transaction(
        &self,
        refund_tx: &Transaction,
        client_pub: PublicKey,
    ) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.lock().await;
        inner.require_state("provide_refund_transaction", &[ServerChannelState::New])?;

        ContractBuilder::validate_canonical_keys(&client_pub, &inner.server_pub)?;

        if refund_tx.input.len() != 1 || refund_tx.output.len() != 1 {
            return Err(Error::Verification(
                "refund must have exactly one input and one output".into(),
            ));
        }
        if refund_tx.input[0].sequence != Sequence::ZERO {
            return Err(Error::Verification(
                "refund's input sequence must be 0".into(),
            ));
        }
        if refund_tx.lock_time.to_consensus_u32() < inner.min_expire_time {
            return Err(Error::Verification(
                "refund lock time is below this server's min_expire_time".into(),
            ));
        }

        let script = inner.multisig_script(&client_pub);
        let signature = tx::sign_input(
            &self.secp,
            refund_tx,
            0,
            &script,
            &inner.server_key,
            EcdsaSighashType::NonePlusAnyoneCanPay,
        );

        inner.client_pub = Some(client_pub);
        inner.contract_outpoint = Some(OutPoint {
            txid: refund_tx.compute_txid(),
            vout: 0,
        });
        inner.state = ServerChannelState::WaitingForMultisigContract;
        debug!(
            target: "paych_core::server",
            "refund signed under NONE|ANYONECANPAY, waiting for the multisig contract"
        );
        Ok(signature)
    }

    /// Validates the multisig contract matches what the refund committed
    /// to, then broadcasts it. Resolves once the broadcaster reports an
    /// outcome; rejects with the broadcaster's error on failure, leaving
    /// the channel in `WaitingForMultisigAcceptance` rather than advancing.
    pub async fn provide_contract(&self, contract: Transaction) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().await;
            inner.require_state("provide_contract", &[ServerChannelState::WaitingForMultisigContract])?;

            let client_pub = inner
                .client_pub
                .unwrap_or_else(|| Error::cannot_happen("client_pub missing in WaitingForMultisigContract"));
            let script = inner.multisig_script(&client_pub);

            if contract.output.is_empty() || contract.output[0].script_pubkey != script {
                return Err(Error::Verification(
                    "contract's output 0 does not pay the expected multisig script".into(),
                ));
            }
            let total_value = contract.output[0].value;
            if dust::is_dust(total_value) {
                return Err(Error::Verification(
                    "contract's multisig output would be dust".into(),
                ));
            }

            inner.total_value = total_value;
            inner.best_value_to_server = Amount::ZERO;
            inner.multisig_contract = Some(contract.clone());
            inner.contract_outpoint = Some(OutPoint {
                txid: contract.compute_txid(),
                vout: 0,
            });
            inner.state = ServerChannelState::WaitingForMultisigAcceptance;
        };

        match self.broadcaster.broadcast(contract).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                inner.state = ServerChannelState::Ready;
                info!(target: "paych_core::server", "contract broadcast, channel ready");
                Ok(())
            }
            Err(e) => {
                warn!(target: "paych_core::server", "contract broadcast failed: {e}");
                Err(e)
            }
        }
    }

    /// Verifies `client_sig_bytes` over the payment it implies, and keeps
    /// it only if it pays the server more than the best seen so far. Returns
    /// `true` while the channel still has room for further increments.
    pub async fn increment_payment(
        &self,
        new_value_to_client: Amount,
        client_sig_bytes: &[u8],
    ) -> Result<bool, Error> {
        let mut inner = self.inner.lock().await;
        inner.require_state("increment_payment", &[ServerChannelState::Ready])?;

        if new_value_to_client > inner.total_value {
            return Err(Error::ValueOutOfRange(
                "new_value_to_client exceeds total_value".into(),
            ));
        }

        let client_pub = inner
            .client_pub
            .unwrap_or_else(|| Error::cannot_happen("client_pub missing when Ready"));
        let contract_outpoint = inner
            .contract_outpoint
            .unwrap_or_else(|| Error::cannot_happen("contract_outpoint missing when Ready"));
        let client_script = payment_script_for_pubkey(&client_pub);
        let candidate = tx::build_unsigned_payment(contract_outpoint, new_value_to_client, client_script);
        let script = inner.multisig_script(&client_pub);

        let expected_sighash_type = if new_value_to_client == Amount::ZERO {
            EcdsaSighashType::NonePlusAnyoneCanPay
        } else {
            EcdsaSighashType::SinglePlusAnyoneCanPay
        };
        let actual_sighash_type =
            tx::verify_input(&self.secp, &candidate, 0, &script, &client_pub, client_sig_bytes)?;
        if actual_sighash_type != expected_sighash_type {
            return Err(Error::Verification(
                "client signature's sighash mode does not match new_value_to_client".into(),
            ));
        }

        let candidate_value_to_server = inner
            .total_value
            .checked_sub(new_value_to_client)
            .unwrap_or_else(|| Error::cannot_happen("new_value_to_client exceeds total_value"));
        if candidate_value_to_server <= inner.best_value_to_server {
            debug!(
                target: "paych_core::server",
                "ignoring non-improving signature: candidate={candidate_value_to_server}, best={}",
                inner.best_value_to_server
            );
            return Ok(inner.best_value_to_server < inner.total_value);
        }

        if dust::is_dust(candidate_value_to_server) {
            return Err(Error::ValueOutOfRange(
                "this payment would pay the server a dust amount".into(),
            ));
        }

        inner.best_value_to_server = candidate_value_to_server;
        inner.best_value_signature = Some(client_sig_bytes.to_vec());
        let id = inner.id;
        let record_snapshot = StoredServerChannel {
            id: id.unwrap_or_else(|| Error::cannot_happen("channel id missing when Ready")),
            major_version: inner.major_version,
            server_key: inner.server_key,
            best_value_to_server: candidate_value_to_server,
            best_value_signature: inner.best_value_signature.clone(),
            contract: inner
                .multisig_contract
                .clone()
                .unwrap_or_else(|| Error::cannot_happen("multisig_contract missing when Ready")),
            close_tx: inner.close_tx.clone(),
        };
        let still_has_room = new_value_to_client > Amount::ZERO;
        drop(inner);
        if let Some(id) = id {
            self.store.update(id, record_snapshot).await?;
        }
        info!(
            target: "paych_core::server",
            "accepted improving payment: best_value_to_server now {candidate_value_to_server}"
        );
        Ok(still_has_room)
    }

    /// Finalizes and broadcasts the best payment seen. May be called again
    /// from `Closing` after a prior broadcast failure; each call rebuilds
    /// and resubmits rather than replaying a cached result.
    pub async fn close(&self) -> Result<Transaction, Error> {
        let finished = {
            let mut inner = self.inner.lock().await;
            inner.require_state("close", &[ServerChannelState::Ready, ServerChannelState::Closing])?;

            let client_sig = inner
                .best_value_signature
                .clone()
                .ok_or_else(|| Error::wrong_state("close", "Ready (no payment accepted yet)"))?;
            let client_pub = inner
                .client_pub
                .unwrap_or_else(|| Error::cannot_happen("client_pub missing when Ready"));
            let contract_outpoint = inner
                .contract_outpoint
                .unwrap_or_else(|| Error::cannot_happen("contract_outpoint missing when Ready"));

            let value_to_client = inner
                .total_value
                .checked_sub(inner.best_value_to_server)
                .unwrap_or_else(|| Error::cannot_happen("best_value_to_server exceeds total_value"));
            let server_value = inner
                .best_value_to_server
                .checked_sub(REFERENCE_DEFAULT_MIN_TX_FEE)
                .ok_or_else(|| Error::InsufficientFunds("best_value_to_server cannot cover the close fee".into()))?;
            if dust::is_dust(server_value) {
                return Err(Error::InsufficientFunds(
                    "server's close output would be dust".into(),
                ));
            }

            let client_script = payment_script_for_pubkey(&client_pub);
            let server_script = payment_script_for_pubkey(&inner.server_pub);
            let close_tx = tx::build_unsigned_payment(contract_outpoint, value_to_client, client_script);
            let close_tx = tx::append_server_output(close_tx, server_value, server_script);

            let script = inner.multisig_script(&client_pub);
            let server_sig = tx::sign_input(
                &self.secp,
                &close_tx,
                0,
                &script,
                &inner.server_key,
                EcdsaSighashType::All,
            );

            let mut finished = close_tx;
            finished.input[0].script_sig = tx::assemble_multisig_script_sig(&client_sig, &server_sig);
            inner.state = ServerChannelState::Closing;
            finished
        };

        match self.broadcaster.broadcast(finished.clone()).await {
            Ok(()) => {
                let id = {
                    let mut inner = self.inner.lock().await;
                    inner.state = ServerChannelState::Closed;
                    inner.close_tx = Some(finished.clone());
                    inner.id
                };
                if let Some(id) = id {
                    self.store.remove(id).await?;
                }
                self.wallet.commit_transaction(finished.clone()).await?;
                info!(target: "paych_core::server", "close transaction broadcast and settled");
                Ok(finished)
            }
            Err(e) => {
                warn!(target: "paych_core::server", "close broadcast failed, remaining in Closing for retry: {e}");
                Err(e)
            }
        }
    }

    /// Registers the channel in the `ChannelStore`. Symmetric with
    /// [`crate::client::ClientState::store_channel_in_wallet`]; idempotent if
    /// called again with the same `id` while still `WaitingForMultisigAcceptance`
    /// or later.
    pub async fn store_channel_in_wallet(&self, id: ChannelId) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.id {
            if existing == id
                && !matches!(
                    inner.state,
                    ServerChannelState::New | ServerChannelState::WaitingForMultisigContract
                )
            {
                return Ok(());
            }
        }
        inner.require_state(
            "store_channel_in_wallet",
            &[
                ServerChannelState::WaitingForMultisigAcceptance,
                ServerChannelState::Ready,
            ],
        )?;

        let record = StoredServerChannel {
            id,
            major_version: inner.major_version,
            server_key: inner.server_key,
            best_value_to_server: inner.best_value_to_server,
            best_value_signature: inner.best_value_signature.clone(),
            contract: inner
                .multisig_contract
                .clone()
                .unwrap_or_else(|| Error::cannot_happen("multisig_contract missing in WaitingForMultisigAcceptance")),
            close_tx: inner.close_tx.clone(),
        };
        self.store.add(id, record).await?;
        inner.id = Some(id);
        info!(target: "paych_core::server", "channel {id} stored");
        Ok(())
    }

    pub async fn get_best_value_to_server(&self) -> Amount {
        self.inner.lock().await.best_value_to_server
    }

    /// The fee [`ServerState::close`] would take from `best_value_to_server`
    /// to compute its own output.
    pub async fn get_fee_paid(&self) -> Amount {
        let best_value_to_server = self.inner.lock().await.best_value_to_server;
        REFERENCE_DEFAULT_MIN_TX_FEE.min(best_value_to_server)
    }

    pub async fn get_contract(&self) -> Result<Transaction, Error> {
        let inner = self.inner.lock().await;
        inner
            .multisig_contract
            .clone()
            .ok_or_else(|| Error::wrong_state("get_contract", inner.state))
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == ServerChannelState::Closed
    }

    pub async fn get_major_version(&self) -> u8 {
        self.inner.lock().await.major_version
    }

    pub async fn get_state(&self) -> ServerChannelState {
        self.inner.lock().await.state
    }
}
