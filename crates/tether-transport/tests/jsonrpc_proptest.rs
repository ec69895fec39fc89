use std::collections::HashSet;

use proptest::prelude::*;
use serde_json::{json, Value};
use tether_transport::{
    now_ms, payload_id, relay_rpc_id, JsonRpcError, JsonRpcPayload, JsonRpcRequest,
    JsonRpcResponse,
};

fn arb_params() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(|n| json!(n)),
        ".{0,64}".prop_map(|s| json!({ "topic": s })),
        prop::collection::vec("[a-z0-9]{1,16}", 0..8).prop_map(|v| json!(v)),
    ]
}

proptest! {
    /// A request never parses as a response and vice versa.
    #[test]
    fn frames_keep_their_kind(
        id in any::<u64>(),
        method in "[a-z]{2,8}_[a-zA-Z]{2,16}",
        params in arb_params(),
        code in any::<i64>(),
        message in ".{0,64}",
    ) {
        let request = JsonRpcRequest::with_id(id, method, params.clone());
        let parsed = JsonRpcPayload::parse(&request.to_json().unwrap()).unwrap();
        prop_assert_eq!(parsed, JsonRpcPayload::Request(request));

        let ok = JsonRpcResponse::result(id, params);
        let parsed = JsonRpcPayload::parse(&ok.to_json().unwrap()).unwrap();
        prop_assert_eq!(parsed, JsonRpcPayload::Response(ok));

        let err = JsonRpcResponse::error(id, JsonRpcError::new(code, message));
        match JsonRpcPayload::parse(&err.to_json().unwrap()).unwrap() {
            JsonRpcPayload::Response(r) => prop_assert!(r.is_error()),
            other => prop_assert!(false, "error parsed as {:?}", other),
        }
    }

    /// Ids keep increasing, even when drawn in a burst within one millisecond.
    #[test]
    fn ids_are_unique_and_increasing(count in 1..500usize) {
        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..count {
            let id = payload_id();
            prop_assert!(id > last);
            prop_assert!(seen.insert(id));
            last = id;
        }
    }
}

#[test]
fn ids_lead_with_the_clock() {
    let before = now_ms();
    let peer = payload_id();
    let relay = relay_rpc_id();
    assert!(peer / 1_000 >= before);
    assert!(relay / 1_000_000 >= before);
}

#[test]
fn garbage_is_a_deserialization_error() {
    assert!(JsonRpcPayload::parse("{\"id\": \"x\"}").is_err());
    assert!(JsonRpcPayload::parse("not json").is_err());
}
