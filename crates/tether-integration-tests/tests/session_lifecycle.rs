/// End-to-end session flows between a dapp (proposer) and a wallet
/// (responder) over one in-process relay.
use std::collections::BTreeMap;

use serde_json::json;
use tether_core::{
    ApproveParams, ClientEvent, ConnectParams, ProtocolError, RequestArguments, RequestParams,
    RequiredNamespace, SessionEventData,
};
use tether_integration_tests::{
    establish, eventually, granted_namespaces, init_tracing, required_namespaces,
    subscribe_requests, Peer, ACCOUNT, CHAIN,
};
use tether_transport::{JsonRpcError, JsonRpcResponse, MemoryRelay};

#[tokio::test]
async fn full_session_lifecycle() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();

    // ── Pair, propose, approve ─────────────────────────────────────────
    let session = establish(&mut dapp, &mut wallet).await.unwrap();
    assert_eq!(session.proposer_view.topic, session.topic);
    assert!(session.proposer_view.acknowledged);
    assert!(session.responder_view.acknowledged);
    assert_eq!(
        session.proposer_view.controller,
        session.responder_view.self_.public_key,
        "the responder controls the session"
    );
    assert_eq!(session.proposer_view.namespaces, granted_namespaces());

    let connected = dapp
        .wait_for("session connect", |e| match e {
            ClientEvent::SessionConnect { session } => Some(session.clone()),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(connected.topic, session.topic);

    // Both pairings turn active once the session exists.
    let pairings = wallet.handle.pairings().await.unwrap();
    assert!(pairings
        .iter()
        .any(|p| p.topic == session.pairing_topic && p.active));

    // ── Request and respond ────────────────────────────────────────────
    let sent = dapp
        .handle
        .request(RequestParams {
            topic: session.topic.clone(),
            request: RequestArguments::new("personal_sign", json!(["0xdeadbeef", ACCOUNT])),
            chain_id: CHAIN.into(),
            expiry: None,
        })
        .await
        .unwrap();

    let (id, params) = wallet
        .wait_for("session request", |e| match e {
            ClientEvent::SessionRequest { id, params, .. } => Some((*id, params.clone())),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(id, sent.id);
    assert_eq!(params.request.method, "personal_sign");
    assert_eq!(params.chain_id, CHAIN);
    assert_eq!(wallet.handle.pending_session_requests().await.unwrap().len(), 1);

    wallet
        .handle
        .respond(&session.topic, JsonRpcResponse::result(id, json!("0xsignature")))
        .await
        .unwrap();
    assert_eq!(sent.response.wait().await.unwrap(), json!("0xsignature"));
    assert!(wallet.handle.pending_session_requests().await.unwrap().is_empty());

    // ── Events flow from the wallet ────────────────────────────────────
    wallet
        .handle
        .emit(
            &session.topic,
            SessionEventData::new("accountsChanged", json!([ACCOUNT])),
            CHAIN,
        )
        .await
        .unwrap();
    let event = dapp
        .wait_for("session event", |e| match e {
            ClientEvent::SessionEvent { event, chain_id, .. } => {
                Some((event.clone(), chain_id.clone()))
            }
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(event.0.name, "accountsChanged");
    assert_eq!(event.1, CHAIN);

    // ── Update and extend, controller only ─────────────────────────────
    let mut widened = granted_namespaces();
    widened
        .get_mut("eip155")
        .unwrap()
        .accounts
        .push("eip155:137:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb".into());
    let acked = wallet
        .handle
        .update(&session.topic, widened.clone())
        .await
        .unwrap();
    assert_eq!(acked.wait().await.unwrap(), json!(true));
    let updated = dapp
        .wait_for("session update", |e| match e {
            ClientEvent::SessionUpdate { namespaces, .. } => Some(namespaces.clone()),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(updated, widened);

    let err = dapp
        .handle
        .update(&session.topic, granted_namespaces())
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Unauthorized(_)));
    let err = dapp.handle.extend(&session.topic).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Unauthorized(_)));

    wallet
        .handle
        .extend(&session.topic)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    dapp.wait_for("session extend", |e| {
        matches!(e, ClientEvent::SessionExtend { .. }).then_some(())
    })
    .await
    .unwrap();

    // ── Ping, then tear down ───────────────────────────────────────────
    dapp.handle.ping(&session.topic).await.unwrap();
    wallet
        .wait_for("session ping", |e| {
            matches!(e, ClientEvent::SessionPing { .. }).then_some(())
        })
        .await
        .unwrap();

    dapp.handle.disconnect(&session.topic).await.unwrap();
    let deleted = wallet
        .wait_for("session delete", |e| match e {
            ClientEvent::SessionDelete { topic, .. } => Some(topic.clone()),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(deleted, session.topic);
    assert!(dapp.handle.sessions().await.unwrap().is_empty());
    assert!(wallet.handle.sessions().await.unwrap().is_empty());
    eventually("both sides unsubscribed", || {
        relay.subscriber_count(&session.topic) == 0
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn rejected_proposal_fails_the_approval() {
    init_tracing();
    let relay = MemoryRelay::new();
    let dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();

    let connection = dapp
        .handle
        .connect(ConnectParams {
            required_namespaces: required_namespaces(),
            ..ConnectParams::default()
        })
        .await
        .unwrap();
    wallet
        .handle
        .pair(connection.uri.as_deref().unwrap(), false)
        .await
        .unwrap();
    let id = wallet
        .wait_for("session proposal", |e| match e {
            ClientEvent::SessionProposal { id, .. } => Some(*id),
            _ => None,
        })
        .await
        .unwrap();

    wallet
        .handle
        .reject(id, JsonRpcError::new(5000, "User rejected."))
        .await
        .unwrap();
    let err = connection.approval.wait().await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rpc { code: 5000, .. }));
    assert!(wallet.handle.proposals().await.unwrap().is_empty());
    assert!(dapp.handle.proposals().await.unwrap().is_empty());
}

#[tokio::test]
async fn approval_must_cover_required_namespaces() {
    init_tracing();
    let relay = MemoryRelay::new();
    let dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();

    let connection = dapp
        .handle
        .connect(ConnectParams {
            required_namespaces: required_namespaces(),
            ..ConnectParams::default()
        })
        .await
        .unwrap();
    wallet
        .handle
        .pair(connection.uri.as_deref().unwrap(), false)
        .await
        .unwrap();
    let id = wallet
        .wait_for("session proposal", |e| match e {
            ClientEvent::SessionProposal { id, .. } => Some(*id),
            _ => None,
        })
        .await
        .unwrap();

    let mut narrow = granted_namespaces();
    narrow
        .get_mut("eip155")
        .unwrap()
        .methods
        .retain(|m| m != "personal_sign");
    let err = wallet
        .handle
        .approve(ApproveParams {
            id,
            namespaces: narrow,
            relay_protocol: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::NonConformingNamespaces(_)));
    assert!(wallet.handle.sessions().await.unwrap().is_empty());

    // The proposal is still open; a conforming grant goes through.
    let approval = wallet
        .handle
        .approve(ApproveParams {
            id,
            namespaces: granted_namespaces(),
            relay_protocol: None,
        })
        .await
        .unwrap();
    let settled = connection.approval.wait().await.unwrap();
    assert_eq!(settled.topic, approval.topic);
}

#[tokio::test]
async fn used_pairing_uri_is_refused() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();

    let created = dapp.handle.create_pairing().await.unwrap();
    // Pairing an inactive topic twice only subscribes once.
    wallet.handle.pair(&created.uri, false).await.unwrap();
    wallet.handle.pair(&created.uri, false).await.unwrap();
    eventually("both clients subscribed", || {
        relay.subscriber_count(&created.topic) == 2
    })
    .await
    .unwrap();
    assert_eq!(
        subscribe_requests(&relay, &created.topic),
        2,
        "one subscribe per client"
    );

    wallet.handle.activate_pairing(&created.topic).await.unwrap();
    let err = wallet.handle.pair(&created.uri, true).await.unwrap_err();
    assert!(matches!(err, ProtocolError::PairingExists { .. }));

    // Proposing on the active pairing reuses it.
    let session = establish(&mut dapp, &mut wallet).await.unwrap();
    assert_ne!(session.pairing_topic, created.topic);
    let reused = dapp
        .handle
        .connect(ConnectParams {
            required_namespaces: required_namespaces(),
            pairing_topic: Some(session.pairing_topic.clone()),
            ..ConnectParams::default()
        })
        .await
        .unwrap();
    assert!(reused.uri.is_none());
    assert_eq!(reused.pairing_topic, session.pairing_topic);
}

#[tokio::test]
async fn request_validation_happens_before_sending() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();
    let session = establish(&mut dapp, &mut wallet).await.unwrap();
    relay.clear_log();

    let request = |method: &str, chain: &str, expiry: Option<u64>| RequestParams {
        topic: session.topic.clone(),
        request: RequestArguments::new(method, json!([])),
        chain_id: chain.into(),
        expiry,
    };

    for (params, what) in [
        (request("personal_sign", CHAIN, Some(10)), "expiry below five minutes"),
        (
            request("personal_sign", CHAIN, Some(8 * 24 * 60 * 60)),
            "expiry above seven days",
        ),
        (request("eth_signTypedData", CHAIN, None), "method not granted"),
        (request("personal_sign", "eip155:10", None), "chain not granted"),
    ] {
        let err = dapp.handle.request(params).await.unwrap_err();
        assert!(
            matches!(err, ProtocolError::MissingOrInvalid(_)),
            "{what}: {err}"
        );
    }

    let err = dapp
        .handle
        .request(RequestParams {
            topic: "0".repeat(64),
            ..request("personal_sign", CHAIN, None)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::NoMatchingKey(_)));
    assert_eq!(relay.rpc_count("irn_publish"), 0);
}

#[tokio::test]
async fn find_returns_sessions_covering_the_request() {
    init_tracing();
    let relay = MemoryRelay::new();
    let mut dapp = Peer::spawn(&relay, "dapp").await.unwrap();
    let mut wallet = Peer::spawn(&relay, "wallet").await.unwrap();
    let session = establish(&mut dapp, &mut wallet).await.unwrap();

    let found = dapp.handle.find(required_namespaces()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].topic, session.topic);

    let solana = BTreeMap::from([(
        "solana".to_string(),
        RequiredNamespace {
            chains: Some(vec!["solana:4sGjMW1sUnHzSxGspuhpqLDx6wiyjNtZ".into()]),
            methods: vec!["solana_signMessage".into()],
            events: Vec::new(),
        },
    )]);
    assert!(dapp.handle.find(solana).await.unwrap().is_empty());
}
