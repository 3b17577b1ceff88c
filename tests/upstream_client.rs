//! JSON-RPC client against a mocked node

use assert_matches::assert_matches;
use getwork_gateway::Error;
use getwork_gateway::config::UpstreamConfig;
use getwork_gateway::upstream::{RpcClient, Upstream};
use mockito::Matcher;
use serde_json::json;

fn client(url: &str, namespace: &str) -> RpcClient {
    let config = UpstreamConfig {
        name: "mock".to_string(),
        url: url.to_string(),
        timeout: "2s".to_string(),
        pool: 2,
    };
    RpcClient::new(&config, namespace).unwrap()
}

fn hash(c: char) -> String {
    format!("0x{}", c.to_string().repeat(64))
}

#[tokio::test]
async fn get_work_uses_namespace() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::PartialJson(json!({"jsonrpc": "2.0", "method": "aqua_getWork"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"jsonrpc": "2.0", "id": 1, "result": [hash('a'), hash('b'), hash('0'), "0x10"]})
                .to_string(),
        )
        .create_async()
        .await;

    let work = client(&server.url(), "aqua").get_work().await.unwrap();
    assert_eq!(work.len(), 4);
    assert_eq!(work[0], hash('a'));
    mock.assert_async().await;
}

#[tokio::test]
async fn eth_namespace_is_configurable() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::PartialJson(json!({"method": "eth_submitWork"})))
        .with_status(200)
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": true}).to_string())
        .create_async()
        .await;

    let params = vec!["0x00000000000000ff".to_string(), hash('a'), hash('b')];
    assert!(client(&server.url(), "eth").submit_work(&params).await.unwrap());
    mock.assert_async().await;
}

#[tokio::test]
async fn rejected_submission_is_false() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": false}).to_string())
        .create_async()
        .await;

    let params = vec!["0x00000000000000ff".to_string(), hash('a'), hash('b')];
    assert!(!client(&server.url(), "aqua").submit_work(&params).await.unwrap());
}

#[tokio::test]
async fn rpc_error_object_is_upstream_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "no work"}})
                .to_string(),
        )
        .create_async()
        .await;

    let err = client(&server.url(), "aqua").get_work().await.unwrap_err();
    assert_matches!(err, Error::Upstream { ref message, .. } if message.contains("no work"));
    assert!(err.is_upstream_fault());
}

#[tokio::test]
async fn http_status_and_short_work_are_errors() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(502)
        .create_async()
        .await;
    assert!(client(&server.url(), "aqua").get_work().await.is_err());

    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/")
        .with_status(200)
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": [hash('a')]}).to_string())
        .create_async()
        .await;
    assert_matches!(
        client(&server.url(), "aqua").get_work().await,
        Err(Error::Upstream { .. })
    );
}

#[tokio::test]
async fn submit_hashrate_forwards_params() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::PartialJson(
            json!({"method": "aqua_submitHashrate", "params": ["0x500000", hash('c')]}),
        ))
        .with_status(200)
        .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": true}).to_string())
        .create_async()
        .await;

    assert!(client(&server.url(), "aqua")
        .submit_hashrate("0x500000", &hash('c'))
        .await
        .unwrap());
    mock.assert_async().await;
}

#[tokio::test]
async fn unreachable_node_fails_check() {
    // Nothing listens on port 9 locally
    let unreachable = client("http://127.0.0.1:9", "aqua");
    assert!(unreachable.check().await.is_err());
}
