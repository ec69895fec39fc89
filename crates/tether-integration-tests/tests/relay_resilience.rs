/// Behaviour under relay failures: dropped sockets, lost publish acks,
/// refused connections and client restarts.
use std::time::Duration;

use serde_json::json;
use tether_core::{
    ClientEvent, ProtocolError, RequestArguments, RequestParams, RetryPolicy, SessionEventData,
};
use tether_integration_tests::{
    establish, eventually, fast_config, init_tracing, subscribe_requests, Peer, ACCOUNT, CHAIN,
};
use tether_transport::{JsonRpcResponse, MemoryRelay};

async fn round_trip(dapp: &mut Peer, wallet: &mut Peer, topic: &str) {
    let sent = dapp
        .handle
        .request(RequestParams {
            topic: topic.to_string(),
            request: RequestArguments::new("personal_sign", json!(["0x01", ACCOUNT])),
            chain_id: CHAIN.into(),
            expiry: None,
        })
        .await
        .unwrap();
    let id = wallet
        .wait_for("session request", |e| match e {
            ClientEvent::SessionRequest { id, .. } => Some(*id),
            _ => None,
        })
        .await
        .unwrap();
    wallet
        .handle
        .respond(topic, JsonRpcResponse::result(id, json!("0xok")))
        .await
        .unwrap();
    assert_eq!(sent.response.wait().await.unwrap(), json!("0xok"));
}

#[tokio::test]
async fn relay_restart_resubscribes_in_one_batch() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();
    let session = establish(&mut dapp, &mut wallet).await.unwrap();
    relay.clear_log();

    relay.disconnect_all();
    for peer in [&mut dapp, &mut wallet] {
        peer.wait_for("disconnect", |e| {
            matches!(e, ClientEvent::RelayerDisconnect).then_some(())
        })
        .await
        .unwrap();
        peer.wait_for("resubscribed", |e| {
            matches!(e, ClientEvent::SubscriptionResubscribed).then_some(())
        })
        .await
        .unwrap();
    }

    assert_eq!(relay.connection_count(), 2);
    assert_eq!(relay.rpc_count("irn_subscribe"), 0);
    assert_eq!(relay.rpc_count("irn_batchSubscribe"), 2, "one batch per client");
    assert_eq!(subscribe_requests(&relay, &session.topic), 2);
    assert_eq!(relay.subscriber_count(&session.topic), 2);

    round_trip(&mut dapp, &mut wallet, &session.topic).await;
}

#[tokio::test]
async fn lost_publish_ack_is_retried_and_delivered_once() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();
    let session = establish(&mut dapp, &mut wallet).await.unwrap();
    relay.clear_log();

    // The first publish reaches the dapp but the wallet never hears back.
    relay.drop_publish_acks(1);
    wallet
        .handle
        .emit(
            &session.topic,
            SessionEventData::new("chainChanged", json!(1)),
            CHAIN,
        )
        .await
        .unwrap();

    wallet
        .wait_for("stall", |e| {
            matches!(e, ClientEvent::ConnectionStalled).then_some(())
        })
        .await
        .unwrap();
    let wallet_publishes = relay
        .rpc_params("irn_publish")
        .into_iter()
        .filter(|p| p["topic"] == session.topic.as_str() && p["tag"] == 1110)
        .count();
    assert_eq!(wallet_publishes, 2, "same event published twice");

    let events: Vec<_> = dapp
        .drain_for(Duration::from_secs(1))
        .await
        .into_iter()
        .filter(|e| matches!(e, ClientEvent::SessionEvent { .. }))
        .collect();
    assert_eq!(events.len(), 1, "duplicate delivery is dropped");
}

#[tokio::test]
async fn retry_policy_abandons_unacknowledged_publishes() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut config = fast_config("wallet");
    config.relayer.retry = RetryPolicy {
        max_attempts: 2,
        max_age: None,
    };
    let mut wallet = Peer::spawn_with(&relay, config, Default::default())
        .await
        .unwrap();
    let session = establish(&mut dapp, &mut wallet).await.unwrap();

    relay.drop_publish_acks(usize::MAX);
    let err = wallet
        .handle
        .emit(
            &session.topic,
            SessionEventData::new("chainChanged", json!(1)),
            CHAIN,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Publish(_)), "{err}");

    let attempts = wallet
        .wait_for("abandon", |e| match e {
            ClientEvent::PublishAbandoned { topic, attempts, .. } if *topic == session.topic => {
                Some(*attempts)
            }
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn offline_client_catches_up_when_back_online() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();
    let session = establish(&mut dapp, &mut wallet).await.unwrap();

    wallet.handle.set_online(false).await.unwrap();
    wallet
        .wait_for("disconnect", |e| {
            matches!(e, ClientEvent::RelayerDisconnect).then_some(())
        })
        .await
        .unwrap();
    eventually("wallet socket closed", || relay.connection_count() == 1)
        .await
        .unwrap();

    // Sent while the wallet is away: the relay keeps it in the mailbox.
    let sent = dapp
        .handle
        .request(RequestParams {
            topic: session.topic.clone(),
            request: RequestArguments::new("personal_sign", json!(["0x02", ACCOUNT])),
            chain_id: CHAIN.into(),
            expiry: None,
        })
        .await
        .unwrap();

    wallet.handle.set_online(true).await.unwrap();
    let id = wallet
        .wait_for("session request", |e| match e {
            ClientEvent::SessionRequest { id, .. } => Some(*id),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(id, sent.id);
    wallet
        .handle
        .respond(&session.topic, JsonRpcResponse::result(id, json!("0xlate")))
        .await
        .unwrap();
    assert_eq!(sent.response.wait().await.unwrap(), json!("0xlate"));
}

#[tokio::test]
async fn refused_connection_reports_an_error() {
    init_tracing();
    let relay = MemoryRelay::new();
    relay.refuse_connections(true);
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();

    let message = dapp
        .wait_for("relayer error", |e| match e {
            ClientEvent::RelayerError { message } => Some(message.clone()),
            _ => None,
        })
        .await
        .unwrap();
    assert!(!message.is_empty());
    assert_eq!(relay.connection_count(), 0);

    // Work queued meanwhile goes out once the relay accepts again.
    relay.refuse_connections(false);
    dapp.handle.create_pairing().await.unwrap();
    dapp.wait_for("connect", |e| {
        matches!(e, ClientEvent::RelayerConnect).then_some(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn sessions_survive_a_client_restart() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();
    let session = establish(&mut dapp, &mut wallet).await.unwrap();
    let client_id = dapp.handle.client_id().to_string();

    dapp.handle.shutdown().await;
    while dapp.events.recv().await.is_some() {}

    let storage = dapp.storage.clone();
    let mut dapp = Peer::spawn_with(&relay, fast_config("dapp"), storage)
        .await
        .unwrap();
    assert_eq!(dapp.handle.client_id(), client_id);
    let sessions = dapp.handle.sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].topic, session.topic);

    round_trip(&mut dapp, &mut wallet, &session.topic).await;
}
