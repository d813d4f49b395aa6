mod common;

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value};
use tiny_http::{Response, Server, StatusCode};

use wallet_bridge_adapters::{BridgeConfig, JsonRpcChainClient};
use wallet_bridge_core::{BridgeError, ChainRpcPort, SupportedChain};

use common::init_tracing;

/// (path, method) of every JSON-RPC call the mock saw.
type CallLog = Arc<Mutex<Vec<(String, String)>>>;

fn spawn_rpc_server(calls: CallLog) -> (String, thread::JoinHandle<()>) {
    let server = Server::http("127.0.0.1:0").expect("start server");
    let addr = format!("http://{}", server.server_addr());

    let join = thread::spawn(move || {
        for mut req in server.incoming_requests() {
            let path = req.url().to_owned();
            let mut body = String::new();
            if req.as_reader().read_to_string(&mut body).is_err() {
                continue;
            }
            let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            let method = request["method"].as_str().unwrap_or_default().to_owned();
            if let Ok(mut g) = calls.lock() {
                g.push((path.clone(), method.clone()));
            }

            let (code, result) = match (path.as_str(), method.as_str()) {
                ("/offline", _) => (503, json!({ "error": "unavailable" })),
                ("/wrong-chain", "eth_chainId") => (200, json!({ "result": "0x1" })),
                ("/polygon", "eth_chainId") => (200, json!({ "result": "0x89" })),
                ("/polygon", "eth_getTransactionByHash") => (
                    200,
                    json!({ "result": { "hash": "0x01", "type": "eip1559", "typeHex": "0x2" } }),
                ),
                ("/mainnet", "eth_blockNumber") => (200, json!({ "result": "0x10d4f" })),
                ("/mainnet", "eth_call") => (
                    200,
                    json!({ "error": { "code": 3, "message": "execution reverted" } }),
                ),
                _ => (404, json!({ "error": "not found" })),
            };
            let mut payload = result;
            payload["jsonrpc"] = json!("2.0");
            payload["id"] = request["id"].clone();
            let response =
                Response::from_string(payload.to_string()).with_status_code(StatusCode(code));
            let _ = req.respond(response);
        }
    });

    (addr, join)
}

fn client(base_url: &str) -> JsonRpcChainClient {
    let config = BridgeConfig {
        rpc_url: Some(format!("{base_url}/mainnet")),
        rpc_timeout_ms: 5_000,
        ..BridgeConfig::default()
    };
    JsonRpcChainClient::new(&config)
        .expect("rpc client")
        .with_endpoints(
            SupportedChain::Polygon,
            vec![
                format!("{base_url}/offline"),
                format!("{base_url}/wrong-chain"),
                format!("{base_url}/polygon"),
            ],
        )
}

#[tokio::test]
async fn configured_url_serves_the_default_chain() {
    init_tracing();
    let calls: CallLog = Arc::default();
    let (base_url, _join) = spawn_rpc_server(Arc::clone(&calls));
    let client = client(&base_url);

    let block = client
        .request(SupportedChain::Mainnet, "eth_blockNumber", json!([]))
        .await
        .expect("block number");
    assert_eq!(block, json!("0x10d4f"));
    assert_eq!(
        *calls.lock().expect("calls lock"),
        vec![("/mainnet".to_owned(), "eth_blockNumber".to_owned())]
    );
}

#[tokio::test]
async fn other_chains_search_endpoints_for_the_expected_id() {
    init_tracing();
    let calls: CallLog = Arc::default();
    let (base_url, _join) = spawn_rpc_server(Arc::clone(&calls));
    let client = client(&base_url);

    let tx = client
        .request(
            SupportedChain::Polygon,
            "eth_getTransactionByHash",
            json!(["0x01"]),
        )
        .await
        .expect("transaction");
    assert_eq!(tx["typeHex"], "0x2");
    assert_eq!(
        client.resolved_url(SupportedChain::Polygon),
        Some(format!("{base_url}/polygon"))
    );

    client
        .request(
            SupportedChain::Polygon,
            "eth_getTransactionByHash",
            json!(["0x01"]),
        )
        .await
        .expect("cached endpoint");
    let seen = calls.lock().expect("calls lock").clone();
    let chain_checks = seen.iter().filter(|(_, m)| m == "eth_chainId").count();
    assert_eq!(chain_checks, 3, "each endpoint is checked once: {seen:?}");
}

#[tokio::test]
async fn rpc_errors_keep_the_remote_payload() {
    init_tracing();
    let calls: CallLog = Arc::default();
    let (base_url, _join) = spawn_rpc_server(calls);
    let client = client(&base_url);

    let err = client
        .request(SupportedChain::Mainnet, "eth_call", json!([{}, "latest"]))
        .await
        .expect_err("reverted");
    assert!(matches!(err, BridgeError::Remote(_)));
    assert_eq!(err.code(), Some(3));
}

#[tokio::test]
async fn unreachable_chains_report_a_transport_error() {
    init_tracing();
    let calls: CallLog = Arc::default();
    let (base_url, _join) = spawn_rpc_server(calls);
    let client = client(&base_url).with_endpoints(
        SupportedChain::Sepolia,
        vec![format!("{base_url}/offline")],
    );

    let err = client
        .request(SupportedChain::Sepolia, "eth_blockNumber", json!([]))
        .await
        .expect_err("no endpoint");
    assert!(matches!(err, BridgeError::Transport(_)));
    assert_eq!(client.resolved_url(SupportedChain::Sepolia), None);
}
