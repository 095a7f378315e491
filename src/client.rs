//! The payer's side of the channel (spec.md §4.1).

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::secp256k1::{All, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Amount, OutPoint, PublicKey, Transaction, Txid, TxOut};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::collaborators::{Broadcaster, ChannelStore, FundingPolicy, Wallet};
use crate::contract::{payment_script_for_pubkey, ContractBuilder};
use crate::dust::{self, CENT, REFERENCE_DEFAULT_MIN_TX_FEE};
use crate::error::Error;
use crate::store::{ChannelId, StoredClientChannel};
use crate::tx;

/// The client's lifecycle (spec.md §4.1 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientChannelState {
    New,
    Initiated,
    WaitingForSignedRefund,
    SaveStateInWallet,
    ProvideMultisigContractToServer,
    Ready,
    Expired,
    Closed,
}

impl fmt::Display for ClientChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Returned by [`ClientState::increment_payment_by`]: the signature the
/// server must be given, and the amount actually paid (may exceed the
/// requested size if dust rollup applied).
#[derive(Debug, Clone)]
pub struct IncrementedPayment {
    pub signature: Vec<u8>,
    pub amount: Amount,
}

struct ClientInner {
    state: ClientChannelState,
    id: Option<ChannelId>,
    major_version: u8,
    client_key: SecretKey,
    client_pub: PublicKey,
    server_pub: PublicKey,
    total_value: Amount,
    value_to_client: Amount,
    expiry_time: u32,
    refund_fees: Amount,
    multisig_contract: Option<Transaction>,
    contract_outpoint: Option<OutPoint>,
    refund_tx: Option<Transaction>,
    close_tx: Option<Transaction>,
}

impl ClientInner {
    fn multisig_script(&self) -> bitcoin::ScriptBuf {
        ContractBuilder::multisig_script(&self.client_pub, &self.server_pub)
    }

    fn require_state(&self, operation: &'static str, allowed: &[ClientChannelState]) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::wrong_state(operation, self.state))
        }
    }
}

/// Constructs the channel from the payer's side; accepts the server's
/// refund signature; emits payment signatures; detects on-chain settlement.
///
/// Generic over its three collaborators, following the same
/// generic-over-collaborator-trait shape channel managers in the Lightning
/// ecosystem use (e.g. `rust-lightning`'s `ChannelManager<M, T, ES, ...>`)
/// rather than trait objects, so callers pay no dynamic dispatch cost for a
/// relationship that's fixed for the lifetime of the channel.
pub struct ClientState<W, S, B>
where
    W: Wallet,
    S: ChannelStore<StoredClientChannel>,
    B: Broadcaster,
{
    wallet: Arc<W>,
    store: Arc<S>,
    broadcaster: Arc<B>,
    secp: Secp256k1<All>,
    inner: Mutex<ClientInner>,
}

impl<W, S, B> ClientState<W, S, B>
where
    W: Wallet,
    S: ChannelStore<StoredClientChannel>,
    B: Broadcaster,
{
    /// Validates both public keys and sets up a fresh channel in state
    /// `New`. `client_key`'s public form is derived here and fixed for the
    /// life of the channel.
    pub fn new(
        wallet: Arc<W>,
        store: Arc<S>,
        broadcaster: Arc<B>,
        client_key: SecretKey,
        server_pub: PublicKey,
        total_value: Amount,
        expiry_time: u32,
    ) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let client_pub = PublicKey::new(Secp256k1PublicKey::from_secret_key(&secp, &client_key));
        ContractBuilder::validate_canonical_keys(&client_pub, &server_pub)?;

        Ok(ClientState {
            wallet,
            store,
            broadcaster,
            secp,
            inner: Mutex::new(ClientInner {
                state: ClientChannelState::New,
                id: None,
                major_version: 1,
                client_key,
                client_pub,
                server_pub,
                total_value,
                value_to_client: total_value,
                expiry_time,
                refund_fees: Amount::ZERO,
                multisig_contract: None,
                contract_outpoint: None,
                refund_tx: None,
                close_tx: None,
            }),
        })
    }

    /// Builds the multisig contract and the unsigned refund. Funds the
    /// contract through the wallet; the multisig output is always output 0
    /// and is never reordered.
    pub async fn initiate(&self, user_password: Option<&str>) -> Result<(), Error> {
        let (target_output, total_value, expiry_time, client_pub) = {
            let inner = self.inner.lock().await;
            inner.require_state("initiate", &[ClientChannelState::New])?;
            if inner.total_value == Amount::ZERO {
                return Err(Error::ValueOutOfRange("total_value must be positive".into()));
            }
            if dust::is_dust(inner.total_value) {
                return Err(Error::ValueOutOfRange(
                    "total_value is below the dust threshold".into(),
                ));
            }
            let script = inner.multisig_script();
            (
                TxOut {
                    value: inner.total_value,
                    script_pubkey: script,
                },
                inner.total_value,
                inner.expiry_time,
                inner.client_pub,
            )
        };

        let funded = self
            .wallet
            .fund_output(target_output.clone(), FundingPolicy::default(), user_password)
            .await?;

        let contract = &funded.transaction;
        if contract.output.is_empty() || contract.output[0] != target_output {
            return Err(Error::Verification(
                "wallet did not preserve the multisig output at index 0".into(),
            ));
        }

        let (refund_value, extra_fee) = if total_value >= CENT {
            (total_value, Amount::ZERO)
        } else {
            let residual = total_value
                .checked_sub(REFERENCE_DEFAULT_MIN_TX_FEE)
                .ok_or_else(|| {
                    Error::ValueOutOfRange("total_value too small to cover the refund fee".into())
                })?;
            (residual, REFERENCE_DEFAULT_MIN_TX_FEE)
        };
        if dust::is_dust(refund_value) {
            return Err(Error::ValueOutOfRange(
                "refund output would be below the dust threshold".into(),
            ));
        }

        let contract_outpoint = OutPoint {
            txid: contract.compute_txid(),
            vout: 0,
        };
        let client_script = payment_script_for_pubkey(&client_pub);
        let refund_tx = tx::build_unsigned_refund(contract_outpoint, refund_value, client_script, expiry_time);

        let mut inner = self.inner.lock().await;
        inner.multisig_contract = Some(contract.clone());
        inner.contract_outpoint = Some(contract_outpoint);
        inner.refund_tx = Some(refund_tx);
        inner.refund_fees = funded.fee_paid + extra_fee;
        inner.state = ClientChannelState::Initiated;
        info!(
            target: "paych_core::client",
            "channel initiated: total_value={total_value}, refund_value={refund_value}, refund_fees={}",
            inner.refund_fees
        );
        Ok(())
    }

    /// Returns the unsigned refund; idempotent once past `Initiated`.
    pub async fn get_incomplete_refund_transaction(&self) -> Result<Transaction, Error> {
        let mut inner = self.inner.lock().await;
        inner.require_state(
            "get_incomplete_refund_transaction",
            &[ClientChannelState::Initiated, ClientChannelState::WaitingForSignedRefund],
        )?;
        if inner.state == ClientChannelState::Initiated {
            inner.state = ClientChannelState::WaitingForSignedRefund;
        }
        Ok(inner
            .refund_tx
            .clone()
            .unwrap_or_else(|| Error::cannot_happen("refund_tx missing in Initiated/WaitingForSignedRefund")))
    }

    /// Verifies the server's refund signature is exactly
    /// `NONE|ANYONECANPAY`, countersigns with `ALL`, and assembles the
    /// finished refund.
    pub async fn provide_refund_signature(
        &self,
        server_sig_bytes: &[u8],
        _user_password: Option<&str>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.require_state(
            "provide_refund_signature",
            &[ClientChannelState::WaitingForSignedRefund],
        )?;

        let refund_tx = inner
            .refund_tx
            .clone()
            .unwrap_or_else(|| Error::cannot_happen("refund_tx missing in WaitingForSignedRefund"));
        let script = inner.multisig_script();

        let server_sighash_type =
            tx::verify_input(&self.secp, &refund_tx, 0, &script, &inner.server_pub, server_sig_bytes)?;
        if server_sighash_type != EcdsaSighashType::NonePlusAnyoneCanPay {
            return Err(Error::Verification(
                "server's refund signature must use NONE|ANYONECANPAY".into(),
            ));
        }

        let client_sig = tx::sign_input(
            &self.secp,
            &refund_tx,
            0,
            &script,
            &inner.client_key,
            EcdsaSighashType::All,
        );

        // Re-verify both signatures against the exact transaction we're
        // about to finalize, so a stale server signature (e.g. signed over
        // a refund that was rebuilt since) is caught here rather than once
        // it's already on chain.
        if tx::verify_input(&self.secp, &refund_tx, 0, &script, &inner.client_pub, &client_sig).is_err() {
            return Err(Error::Verification(
                "client's own countersignature failed to verify".into(),
            ));
        }
        if tx::verify_input(&self.secp, &refund_tx, 0, &script, &inner.server_pub, server_sig_bytes).is_err()
        {
            return Err(Error::Verification(
                "server's refund signature does not verify".into(),
            ));
        }

        let mut finished = refund_tx;
        finished.input[0].script_sig = tx::assemble_multisig_script_sig(&client_sig, server_sig_bytes);
        inner.refund_tx = Some(finished);
        inner.state = ClientChannelState::SaveStateInWallet;
        debug!(target: "paych_core::client", "refund fully signed, moving to SaveStateInWallet");
        Ok(())
    }

    /// Registers the channel in the `ChannelStore` and commits the
    /// contract to the wallet. Idempotent if called again with the same
    /// `id`.
    pub async fn store_channel_in_wallet(&self, id: ChannelId) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.id {
            if existing == id
                && matches!(
                    inner.state,
                    ClientChannelState::ProvideMultisigContractToServer | ClientChannelState::Ready
                )
            {
                return Ok(());
            }
        }
        inner.require_state("store_channel_in_wallet", &[ClientChannelState::SaveStateInWallet])?;

        let contract = inner
            .multisig_contract
            .clone()
            .unwrap_or_else(|| Error::cannot_happen("multisig_contract missing in SaveStateInWallet"));
        let refund = inner
            .refund_tx
            .clone()
            .unwrap_or_else(|| Error::cannot_happen("refund_tx missing in SaveStateInWallet"));

        let record = StoredClientChannel {
            id,
            major_version: inner.major_version,
            contract: contract.clone(),
            refund,
            client_key: inner.client_key,
            value_to_client: inner.value_to_client,
            refund_fees: inner.refund_fees,
            active: true,
            close_tx: None,
        };
        self.store.add(id, record).await?;
        self.wallet.commit_transaction(contract).await?;

        inner.id = Some(id);
        inner.state = ClientChannelState::ProvideMultisigContractToServer;
        info!(target: "paych_core::client", "channel {id} stored, handing contract to server");
        Ok(())
    }

    /// Returns the contract; on first call transitions `ProvideMultisigContractToServer → Ready`.
    pub async fn get_contract(&self) -> Result<Transaction, Error> {
        let mut inner = self.inner.lock().await;
        inner.require_state(
            "get_contract",
            &[
                ClientChannelState::ProvideMultisigContractToServer,
                ClientChannelState::Ready,
            ],
        )?;
        if inner.state == ClientChannelState::ProvideMultisigContractToServer {
            inner.state = ClientChannelState::Ready;
            info!(target: "paych_core::client", "channel ready for payments");
        }
        Ok(inner
            .multisig_contract
            .clone()
            .unwrap_or_else(|| Error::cannot_happen("multisig_contract missing when Ready")))
    }

    /// Re-signs the payment transaction with `value_to_client` reduced by
    /// `size`, choosing the sighash mode the remaining value dictates.
    pub async fn increment_payment_by(
        &self,
        size: Amount,
        _user_password: Option<&str>,
    ) -> Result<IncrementedPayment, Error> {
        let mut inner = self.inner.lock().await;

        if now_unix() > inner.expiry_time {
            inner.state = ClientChannelState::Expired;
            let id = inner.id;
            let mut inactive_record = None;
            if let Some(id) = id {
                if let Some(mut record) = self.store.get(id).await? {
                    record.active = false;
                    inactive_record = Some((id, record));
                }
            }
            drop(inner);
            if let Some((id, record)) = inactive_record {
                self.store.update(id, record).await?;
            }
            warn!(target: "paych_core::client", "increment_payment_by called past expiry");
            return Err(Error::expired());
        }

        inner.require_state("increment_payment_by", &[ClientChannelState::Ready])?;

        let mut size = size;
        let mut new_value_to_client = inner
            .value_to_client
            .checked_sub(size)
            .ok_or_else(|| Error::ValueOutOfRange("size exceeds the remaining value_to_client".into()))?;

        if new_value_to_client > Amount::ZERO && dust::is_dust(new_value_to_client) {
            // Dust rollup: consume the sub-dust residual rather than leave
            // an output nobody could ever spend.
            size = inner.value_to_client;
            new_value_to_client = Amount::ZERO;
        }

        let contract_outpoint = inner
            .contract_outpoint
            .unwrap_or_else(|| Error::cannot_happen("contract_outpoint missing when Ready"));
        let client_script = payment_script_for_pubkey(&inner.client_pub);
        let payment_tx = tx::build_unsigned_payment(contract_outpoint, new_value_to_client, client_script);
        let script = inner.multisig_script();

        let sighash_type = if new_value_to_client == Amount::ZERO {
            EcdsaSighashType::NonePlusAnyoneCanPay
        } else {
            EcdsaSighashType::SinglePlusAnyoneCanPay
        };
        let signature = tx::sign_input(&self.secp, &payment_tx, 0, &script, &inner.client_key, sighash_type);

        inner.value_to_client = new_value_to_client;
        let id = inner.id;
        let record_snapshot = StoredClientChannel {
            id: id.unwrap_or_else(|| Error::cannot_happen("channel id missing when Ready")),
            major_version: inner.major_version,
            contract: inner
                .multisig_contract
                .clone()
                .unwrap_or_else(|| Error::cannot_happen("multisig_contract missing when Ready")),
            refund: inner
                .refund_tx
                .clone()
                .unwrap_or_else(|| Error::cannot_happen("refund_tx missing when Ready")),
            client_key: inner.client_key,
            value_to_client: new_value_to_client,
            refund_fees: inner.refund_fees,
            active: true,
            close_tx: inner.close_tx.clone(),
        };
        drop(inner);
        if let Some(id) = id {
            self.store.update(id, record_snapshot).await?;
        }
        debug!(target: "paych_core::client", "payment incremented by {size}, value_to_client now {new_value_to_client}");

        Ok(IncrementedPayment { signature, amount: size })
    }

    /// `true` iff `tx` spends the multisig output with two signatures that
    /// both verify under the channel's keys.
    pub async fn is_settlement_transaction(&self, candidate: &Transaction) -> bool {
        let inner = self.inner.lock().await;
        self.is_settlement_given(&inner, candidate)
    }

    fn is_settlement_given(&self, inner: &ClientInner, candidate: &Transaction) -> bool {
        let Some(outpoint) = inner.contract_outpoint else {
            return false;
        };
        let Some((idx, txin)) = candidate
            .input
            .iter()
            .enumerate()
            .find(|(_, txin)| txin.previous_output == outpoint)
        else {
            return false;
        };
        let Some((client_sig, server_sig)) = tx::sign::extract_multisig_signatures(&txin.script_sig) else {
            return false;
        };
        let script = inner.multisig_script();
        tx::verify_input(&self.secp, candidate, idx, &script, &inner.client_pub, &client_sig).is_ok()
            && tx::verify_input(&self.secp, candidate, idx, &script, &inner.server_pub, &server_sig).is_ok()
    }

    /// To be called by the integrator's wallet-event loop, on the same
    /// logical sequencer as every mutating call, whenever a new transaction
    /// touching this wallet is observed (spec.md §5, §9: same-thread
    /// delivery avoids a locking inversion with callers already holding the
    /// instance mutex).
    pub async fn on_wallet_transaction(&self, candidate: &Transaction) {
        let mut inner = self.inner.lock().await;
        if inner.state != ClientChannelState::Ready {
            return;
        }
        if !self.is_settlement_given(&inner, candidate) {
            return;
        }
        inner.state = ClientChannelState::Closed;
        inner.close_tx = Some(candidate.clone());
        info!(target: "paych_core::client", "settlement detected, channel closed");
    }

    /// To be called by the integrator whenever the wallet's confidence
    /// subsystem reports a new confirmation depth for a transaction. Once
    /// the recorded close transaction reaches the event horizon, the
    /// stored record is removed.
    pub async fn on_confirmation_depth(&self, txid: Txid, depth: u32) {
        let (id, matches) = {
            let inner = self.inner.lock().await;
            let matches = depth >= dust::EVENT_HORIZON_CONFIRMATIONS
                && inner.close_tx.as_ref().map(|t| t.compute_txid()) == Some(txid);
            (inner.id, matches)
        };
        if matches {
            if let Some(id) = id {
                if let Err(e) = self.store.remove(id).await {
                    warn!(target: "paych_core::client", "failed to remove settled channel {id}: {e}");
                } else {
                    info!(target: "paych_core::client", "channel {id} reached event horizon, record removed");
                }
            }
        }
    }

    /// Broadcasts the refund. Valid once the channel is `Ready` or has
    /// already transitioned to `Expired`; the time lock itself is enforced
    /// by the network, not by this crate.
    pub async fn broadcast_refund_transaction(&self) -> Result<(), Error> {
        let refund = {
            let inner = self.inner.lock().await;
            inner.require_state(
                "broadcast_refund_transaction",
                &[ClientChannelState::Ready, ClientChannelState::Expired],
            )?;
            inner
                .refund_tx
                .clone()
                .unwrap_or_else(|| Error::cannot_happen("refund_tx missing in Ready/Expired"))
        };
        self.broadcaster.broadcast(refund).await
    }

    /// Marks the stored record inactive; has no on-chain effect.
    pub async fn disconnect_from_channel(&self) -> Result<(), Error> {
        let id = self.inner.lock().await.id;
        if let Some(id) = id {
            if let Some(mut record) = self.store.get(id).await? {
                record.active = false;
                self.store.update(id, record).await?;
            }
        }
        Ok(())
    }

    pub async fn get_state(&self) -> ClientChannelState {
        self.inner.lock().await.state
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == ClientChannelState::Closed
    }

    pub async fn get_major_version(&self) -> u8 {
        self.inner.lock().await.major_version
    }

    pub async fn get_total_value(&self) -> Amount {
        self.inner.lock().await.total_value
    }

    pub async fn get_value_refunded(&self) -> Amount {
        self.inner.lock().await.value_to_client
    }

    pub async fn get_value_spent(&self) -> Amount {
        let inner = self.inner.lock().await;
        inner.total_value - inner.value_to_client
    }
}

fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Error::cannot_happen("system clock before the UNIX epoch"))
        .as_secs() as u32
}
