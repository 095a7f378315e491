//! End-to-end scenarios from spec.md §8, exercised through the public
//! `ClientState`/`ServerState` API against in-memory collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::locktime::absolute::LockTime;
use bitcoin::secp256k1::{PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, PublicKey, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::collaborators::{Broadcaster, FundedTransaction, FundingPolicy, InMemoryChannelStore, Wallet};
use crate::contract::{payment_script_for_pubkey, ContractBuilder};
use crate::error::{Error, IllegalState};
use crate::store::{ChannelId, StoredClientChannel, StoredServerChannel};
use crate::tx;
use crate::{ClientChannelState, ClientState, ServerState};

struct TestWallet;

#[async_trait]
impl Wallet for TestWallet {
    async fn fund_output(
        &self,
        target_output: TxOut,
        _policy: FundingPolicy,
        _password: Option<&str>,
    ) -> Result<FundedTransaction, Error> {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: 0,
                },
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![target_output],
        };
        Ok(FundedTransaction {
            transaction: tx,
            fee_paid: Amount::from_sat(500),
        })
    }

    async fn commit_transaction(&self, _tx: Transaction) -> Result<(), Error> {
        Ok(())
    }
}

struct AcceptingBroadcaster;

#[async_trait]
impl Broadcaster for AcceptingBroadcaster {
    async fn broadcast(&self, _tx: Transaction) -> Result<(), Error> {
        Ok(())
    }
}

type TestClient = ClientState<TestWallet, InMemoryChannelStore<StoredClientChannel>, AcceptingBroadcaster>;
type TestServer = ServerState<TestWallet, InMemoryChannelStore<StoredServerChannel>, AcceptingBroadcaster>;

struct Harness {
    client: TestClient,
    server: TestServer,
    client_key: SecretKey,
    client_pub: PublicKey,
    server_pub: PublicKey,
}

fn build_harness(total_value: Amount, expiry_time: u32, min_expire_time: u32) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let secp = Secp256k1::new();
    let client_key = SecretKey::from_slice(&[0x11; 32]).unwrap();
    let server_key = SecretKey::from_slice(&[0x22; 32]).unwrap();
    let client_pub = PublicKey::new(Secp256k1PublicKey::from_secret_key(&secp, &client_key));
    let server_pub = PublicKey::new(Secp256k1PublicKey::from_secret_key(&secp, &server_key));

    let client = ClientState::new(
        Arc::new(TestWallet),
        InMemoryChannelStore::new(),
        Arc::new(AcceptingBroadcaster),
        client_key,
        server_pub,
        total_value,
        expiry_time,
    )
    .unwrap();
    let server = ServerState::new(
        Arc::new(TestWallet),
        InMemoryChannelStore::new(),
        Arc::new(AcceptingBroadcaster),
        server_key,
        min_expire_time,
    );

    Harness {
        client,
        server,
        client_key,
        client_pub,
        server_pub,
    }
}

/// Drives a harness through setup (refund exchange, contract handoff,
/// broadcast) so a test can start at `Ready` on both sides.
async fn open_channel(h: &Harness) {
    h.client.initiate(None).await.unwrap();
    let refund = h.client.get_incomplete_refund_transaction().await.unwrap();

    let server_sig = h
        .server
        .provide_refund_transaction(&refund, h.client_pub)
        .await
        .unwrap();
    h.client.provide_refund_signature(&server_sig, None).await.unwrap();

    let id = ChannelId::random();
    h.client.store_channel_in_wallet(id).await.unwrap();
    let contract = h.client.get_contract().await.unwrap();

    h.server.provide_contract(contract).await.unwrap();
    h.server.store_channel_in_wallet(id).await.unwrap();
}

#[tokio::test]
async fn happy_path_three_increments_then_close() {
    let h = build_harness(Amount::from_sat(1_000_000), 2_000_000_000, 1_000_000_000);
    open_channel(&h).await;

    for _ in 0..3 {
        let inc = h
            .client
            .increment_payment_by(Amount::from_sat(100_000), None)
            .await
            .unwrap();
        let new_value_to_client = h.client.get_value_refunded().await;
        let has_room = h
            .server
            .increment_payment(new_value_to_client, &inc.signature)
            .await
            .unwrap();
        assert!(has_room);
    }

    assert_eq!(h.client.get_value_refunded().await, Amount::from_sat(700_000));
    assert_eq!(h.client.get_value_spent().await, Amount::from_sat(300_000));
    assert_eq!(h.server.get_best_value_to_server().await, Amount::from_sat(300_000));

    let close_tx = h.server.close().await.unwrap();
    assert_eq!(close_tx.output.len(), 2);
    assert_eq!(close_tx.output[0].value, Amount::from_sat(700_000));
    assert_eq!(close_tx.output[1].value, Amount::from_sat(299_000));
    assert!(h.server.is_closed().await);
}

#[tokio::test]
async fn non_improving_signature_is_ignored() {
    let h = build_harness(Amount::from_sat(1_000_000), 2_000_000_000, 1_000_000_000);
    open_channel(&h).await;

    for _ in 0..3 {
        let inc = h
            .client
            .increment_payment_by(Amount::from_sat(100_000), None)
            .await
            .unwrap();
        let new_value_to_client = h.client.get_value_refunded().await;
        h.server
            .increment_payment(new_value_to_client, &inc.signature)
            .await
            .unwrap();
    }
    assert_eq!(h.server.get_best_value_to_server().await, Amount::from_sat(300_000));

    // A stale signature claiming only 200_000 to the server (value_to_client
    // = 800_000), built independently of the client's own monotonic state.
    let contract = h.server.get_contract().await.unwrap();
    let contract_outpoint = OutPoint {
        txid: contract.compute_txid(),
        vout: 0,
    };
    let client_script = payment_script_for_pubkey(&h.client_pub);
    let stale_tx = tx::build_unsigned_payment(contract_outpoint, Amount::from_sat(800_000), client_script);
    let script = ContractBuilder::multisig_script(&h.client_pub, &h.server_pub);
    let secp = Secp256k1::new();
    let stale_sig = tx::sign_input(
        &secp,
        &stale_tx,
        0,
        &script,
        &h.client_key,
        EcdsaSighashType::SinglePlusAnyoneCanPay,
    );

    let has_room = h
        .server
        .increment_payment(Amount::from_sat(800_000), &stale_sig)
        .await
        .unwrap();
    assert!(has_room);
    assert_eq!(h.server.get_best_value_to_server().await, Amount::from_sat(300_000));
}

#[tokio::test]
async fn dust_residual_rolls_up_into_the_final_increment() {
    let h = build_harness(Amount::from_sat(600_000), 2_000_000_000, 1_000_000_000);
    open_channel(&h).await;

    h.client
        .increment_payment_by(Amount::from_sat(599_450), None)
        .await
        .unwrap();
    assert_eq!(h.client.get_value_refunded().await, Amount::from_sat(550));

    let inc = h.client.increment_payment_by(Amount::from_sat(100), None).await.unwrap();
    assert_eq!(inc.amount, Amount::from_sat(550));
    assert_eq!(h.client.get_value_refunded().await, Amount::ZERO);
}

#[tokio::test]
async fn expiry_before_close_halts_and_marks_inactive() {
    let h = build_harness(Amount::from_sat(1_000_000), 1, 1);

    let result = h.client.increment_payment_by(Amount::from_sat(10), None).await;
    assert!(matches!(result, Err(Error::IllegalState(IllegalState::ChannelExpired))));
    assert_eq!(h.client.get_state().await, ClientChannelState::Expired);
}

#[tokio::test]
async fn client_rejects_server_refund_signature_with_wrong_sighash() {
    let h = build_harness(Amount::from_sat(1_000_000), 2_000_000_000, 1_000_000_000);
    h.client.initiate(None).await.unwrap();
    let refund = h.client.get_incomplete_refund_transaction().await.unwrap();

    let secp = Secp256k1::new();
    let script = ContractBuilder::multisig_script(&h.client_pub, &h.server_pub);
    // Forged: signed with ALL instead of the required NONE|ANYONECANPAY.
    let bad_sig = tx::sign_input(&secp, &refund, 0, &script, &h.client_key, EcdsaSighashType::All);

    let result = h.client.provide_refund_signature(&bad_sig, None).await;
    assert!(matches!(result, Err(Error::Verification(_))));
    assert_eq!(h.client.get_state().await, ClientChannelState::WaitingForSignedRefund);
}

#[tokio::test]
async fn settlement_is_detected_and_record_removed_at_event_horizon() {
    let h = build_harness(Amount::from_sat(1_000_000), 2_000_000_000, 1_000_000_000);
    open_channel(&h).await;

    let inc = h
        .client
        .increment_payment_by(Amount::from_sat(100_000), None)
        .await
        .unwrap();
    let new_value_to_client = h.client.get_value_refunded().await;
    h.server
        .increment_payment(new_value_to_client, &inc.signature)
        .await
        .unwrap();

    let close_tx = h.server.close().await.unwrap();

    assert!(h.client.is_settlement_transaction(&close_tx).await);
    h.client.on_wallet_transaction(&close_tx).await;
    assert!(h.client.is_closed().await);

    h.client.on_confirmation_depth(close_tx.compute_txid(), 6).await;
}
