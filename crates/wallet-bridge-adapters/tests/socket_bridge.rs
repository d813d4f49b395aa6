mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use wallet_bridge_adapters::{MemorySocketHub, MemoryTokenStore};
use wallet_bridge_core::{
    BridgeError, Communicator, EnvironmentDescriptor, RequestArguments, SocketQuery,
    StrategyKind, SupportedChain, TokenErrorKind, TokenStorePort,
};

use common::{
    eventually, init_tracing, make_token, options, record_event, socket_hosts, socket_provider,
    write_token, SOCKET_URL, WALLET,
};

fn sign_request(text_hex: &str) -> RequestArguments {
    RequestArguments::new("personal_sign", json!([text_hex, WALLET]))
}

#[tokio::test]
async fn top_level_pages_connect_with_the_stored_token() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let token = write_token();
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(token.clone()));
    assert_eq!(provider.strategy_kind(), StrategyKind::Socket);

    let connections = hub.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].url, SOCKET_URL);
    assert_eq!(
        connections[0].query,
        SocketQuery {
            token,
            device_id: provider.communicator().device_id().to_owned(),
        }
    );
}

#[tokio::test]
async fn construction_fails_without_a_token() {
    init_tracing();
    let hub = MemorySocketHub::default();
    let hosts = socket_hosts(&hub, MemoryTokenStore::default());
    let err = Communicator::new(&EnvironmentDescriptor::top_level(), hosts.bindings, &options())
        .expect_err("no token stored");
    assert!(matches!(err, BridgeError::SessionMissing));
    assert!(hub.connections().is_empty());
}

#[tokio::test]
async fn accounts_come_from_the_session_token() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));

    let accounts = provider
        .request(RequestArguments::bare("eth_accounts"))
        .await
        .expect("eth_accounts");
    assert_eq!(accounts, json!([WALLET]));
    let socket = hub.last_socket().expect("socket");
    assert!(socket.emitted().is_empty());
}

#[tokio::test]
async fn accounts_survive_unrecognized_grants() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let token = make_token(json!({ "permissions": "admin", "type": "service", "wallet": WALLET }));
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(token));

    let accounts = provider
        .request(RequestArguments::bare("eth_accounts"))
        .await
        .expect("eth_accounts");
    assert_eq!(accounts, json!([WALLET]));
    assert!(!provider.communicator().is_disconnected());
}

#[tokio::test]
async fn accounts_without_a_wallet_claim_disconnect() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let token = make_token(json!({ "permissions": "write", "type": "sso" }));
    let (provider, hosts) = socket_provider(&hub, MemoryTokenStore::with_token(token));

    let err = provider
        .request(RequestArguments::bare("eth_accounts"))
        .await
        .expect_err("no wallet in token");
    assert!(matches!(err, BridgeError::SessionMissing));
    assert!(provider.communicator().is_disconnected());
    assert_eq!(hosts.store.load(), None);
    let socket = hub.last_socket().expect("socket");
    assert!(socket.is_disconnected());
    assert_eq!(socket.listener_count(), 0);
}

#[tokio::test]
async fn read_only_tokens_never_emit_wallet_actions() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let token = make_token(json!({ "permissions": "read", "wallet": WALLET }));
    let (provider, hosts) = socket_provider(&hub, MemoryTokenStore::with_token(token));

    let err = provider
        .request(sign_request("0x68656c6c6f"))
        .await
        .expect_err("read permission");
    assert!(matches!(err, BridgeError::PermissionDenied));
    assert_eq!(err.code(), Some(4100));
    assert_eq!(hosts.signals.count(TokenErrorKind::Permissions), 1);

    let socket = hub.last_socket().expect("socket");
    assert!(socket.emitted_on("wallet-action").is_empty());
}

#[tokio::test]
async fn wallet_actions_resolve_through_ack_and_response() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let socket = hub.last_socket().expect("socket");
    socket.set_responder(Arc::new(|event: &str, _payload: &Value| {
        if event != "wallet-action" {
            return Vec::new();
        }
        vec![
            ("wallet-action".to_owned(), json!({ "messageId": 41 })),
            (
                "wallet-action-response".to_owned(),
                json!({ "messageId": 41, "data": "0xsigned" }),
            ),
        ]
    }));

    let signature = provider
        .request(sign_request("0x68656c6c6f"))
        .await
        .expect("personal_sign");
    assert_eq!(signature, json!("0xsigned"));

    let actions = socket.emitted_on("wallet-action");
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["type"], "personal_sign");
    assert_eq!(actions[0]["data"], "hello");
    assert_eq!(actions[0]["bridge"], "ws");
    assert_eq!(
        actions[0]["sessionId"],
        provider.communicator().device_id()
    );
}

#[tokio::test]
async fn wallet_action_errors_surface_the_remote_payload() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let socket = hub.last_socket().expect("socket");
    socket.set_responder(Arc::new(|event: &str, _payload: &Value| {
        if event != "wallet-action" {
            return Vec::new();
        }
        vec![
            ("wallet-action".to_owned(), json!({ "messageId": "m-1" })),
            (
                "wallet-action-response".to_owned(),
                json!({ "messageId": "m-1", "error": { "code": 4001, "message": "rejected" } }),
            ),
        ]
    }));

    let err = provider
        .request(sign_request("0x68656c6c6f"))
        .await
        .expect_err("rejected");
    assert_eq!(err.code(), Some(4001));
}

#[tokio::test]
async fn acknowledgements_claim_the_latest_wallet_action() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let socket = hub.last_socket().expect("socket");

    let server = async {
        eventually("both actions emitted", || {
            socket.emitted_on("wallet-action").len() == 2
        })
        .await;
        socket.server_push("wallet-action", json!({ "messageId": "m-a" }));
        socket.server_push("wallet-action", json!({ "messageId": "m-b" }));
        socket.server_push(
            "wallet-action-response",
            json!({ "messageId": "m-a", "data": "0xA" }),
        );
        socket.server_push(
            "wallet-action-response",
            json!({ "messageId": "m-b", "data": "0xB" }),
        );
    };
    let (first, second, ()) = tokio::join!(
        provider.request(sign_request("0x6f6e65")),
        provider.request(sign_request("0x74776f")),
        server,
    );
    // The first ack answers the most recent action.
    assert_eq!(second.expect("second"), json!("0xA"));
    assert_eq!(first.expect("first"), json!("0xB"));
}

#[tokio::test]
async fn sends_wait_for_the_first_connection() {
    init_tracing();
    let hub = MemorySocketHub::default();
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let socket = hub.last_socket().expect("socket");

    let server = async {
        tokio::task::yield_now().await;
        assert!(socket.emitted().is_empty());
        socket.server_connect("client-7");
        eventually("switch emitted", || {
            socket.emitted_on("wallet_switchEthereumChain").len() == 1
        })
        .await;
        let sent = socket.emitted_on("wallet_switchEthereumChain");
        socket.server_push(
            "wallet_switchEthereumChain",
            json!({ "id": sent[0]["id"], "data": null }),
        );
    };
    let (switched, ()) = tokio::join!(
        provider.request(RequestArguments::new(
            "wallet_switchEthereumChain",
            json!([{ "chainId": 11155111 }]),
        )),
        server,
    );
    assert_eq!(switched.expect("switch"), Value::Null);
    assert_eq!(provider.chain(), SupportedChain::Sepolia);
    let sent = socket.emitted_on("wallet_switchEthereumChain");
    assert_eq!(sent[0]["chainId"], 11_155_111);
    // Protocol handlers plus the chainChanged relay.
    assert_eq!(provider.communicator().attached_listeners(), 7);
}

#[tokio::test]
async fn sends_after_a_dropped_connection_wait_for_the_reconnect() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let socket = hub.last_socket().expect("socket");
    socket.set_responder(Arc::new(|event: &str, _payload: &Value| {
        if event != "wallet-action" {
            return Vec::new();
        }
        vec![
            ("wallet-action".to_owned(), json!({ "messageId": "m-1" })),
            (
                "wallet-action-response".to_owned(),
                json!({ "messageId": "m-1", "data": "0xsigned" }),
            ),
        ]
    }));

    socket.server_disconnect();
    assert_eq!(provider.communicator().attached_listeners(), 7);

    let server = async {
        tokio::task::yield_now().await;
        eventually("deferred until reconnect", || {
            socket.listener_count() > 7
        })
        .await;
        assert!(socket.emitted_on("wallet-action").is_empty());
        socket.server_connect("client-2");
    };
    let (signature, ()) = tokio::join!(provider.request(sign_request("0x68656c6c6f")), server);
    assert_eq!(signature.expect("signed after reconnect"), json!("0xsigned"));
    assert_eq!(socket.emitted_on("wallet-action").len(), 1);
    assert_eq!(provider.communicator().attached_listeners(), 7);
}

#[tokio::test]
async fn token_errors_expire_the_session_and_fail_pending_actions() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let socket = hub.last_socket().expect("socket");

    let server = async {
        eventually("action emitted", || {
            socket.emitted_on("wallet-action").len() == 1
        })
        .await;
        socket.server_push("token-error", json!({ "message": "jwt expired" }));
    };
    let (outcome, ()) = tokio::join!(provider.request(sign_request("0x68656c6c6f")), server);
    let err = outcome.expect_err("token rejected");
    assert!(matches!(err, BridgeError::SessionExpired));
    assert_eq!(hosts.store.load(), None);
    assert_eq!(hosts.signals.count(TokenErrorKind::Expired), 1);
}

#[tokio::test]
async fn remote_chain_changes_arrive_over_the_socket() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, _hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let changes = record_event(&provider, "chainChanged");
    let socket = hub.last_socket().expect("socket");

    socket.server_push("chainChanged", json!({ "data": { "chainId": 137 } }));
    assert_eq!(provider.chain(), SupportedChain::Polygon);
    assert_eq!(
        *changes.lock().expect("changes lock"),
        vec![json!({ "chainId": "137" })]
    );
}

#[tokio::test]
async fn disconnect_closes_the_channel_and_fails_pending_actions() {
    init_tracing();
    let hub = MemorySocketHub::connected_as("client-1");
    let (provider, hosts) = socket_provider(&hub, MemoryTokenStore::with_token(write_token()));
    let disconnects = record_event(&provider, "disconnect");
    let socket = hub.last_socket().expect("socket");

    let teardown = async {
        eventually("action emitted", || {
            socket.emitted_on("wallet-action").len() == 1
        })
        .await;
        provider.disconnect().await;
        provider.disconnect().await;
    };
    let (outcome, ()) = tokio::join!(provider.request(sign_request("0x68656c6c6f")), teardown);
    assert!(matches!(outcome, Err(BridgeError::Disconnected)));

    assert!(socket.is_disconnected());
    assert_eq!(socket.listener_count(), 0);
    assert_eq!(provider.communicator().attached_listeners(), 0);
    assert_eq!(hosts.store.load(), None);
    assert_eq!(disconnects.lock().expect("disconnects lock").len(), 2);
}
