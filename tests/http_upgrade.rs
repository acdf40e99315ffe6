//! HTTP CONNECT upgrade and debug page.

use std::sync::Arc;

use fastrpc::{Client, Options, Server, Service};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(serde::Serialize, serde::Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

async fn start_http_server() -> String {
    let server = Arc::new(Server::new());
    server
        .register(
            Service::build("Foo")
                .method("Sum", |args: Args| async move {
                    Ok::<_, String>(args.num1 + args.num2)
                })
                .finish(),
        )
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.serve_http(listener).await });
    addr
}

#[tokio::test]
async fn test_dial_http_round_trip() {
    let addr = start_http_server().await;

    let client = Client::dial_http(&addr, Options::default()).await.unwrap();
    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 10, num2: 20 })
        .await
        .unwrap();
    assert_eq!(reply, 30);
}

#[tokio::test]
async fn test_xdial_http_scheme() {
    let addr = start_http_server().await;

    let client = Client::xdial(&format!("http@{addr}"), Options::json())
        .await
        .unwrap();
    let reply: i64 = client
        .call("Foo.Sum", &Args { num1: 3, num2: 4 })
        .await
        .unwrap();
    assert_eq!(reply, 7);
}

#[tokio::test]
async fn test_non_connect_gets_405() {
    let addr = start_http_server().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /_fastrpc_ HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.0 405"));
    assert!(response.contains("must CONNECT"));
}

#[tokio::test]
async fn test_unknown_path_gets_404() {
    let addr = start_http_server().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /elsewhere HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.0 404"));
}

#[tokio::test]
async fn test_debug_page_counts_calls() {
    let addr = start_http_server().await;

    let client = Client::dial_http(&addr, Options::default()).await.unwrap();
    for _ in 0..3 {
        let _: i64 = client
            .call("Foo.Sum", &Args { num1: 1, num2: 1 })
            .await
            .unwrap();
    }

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /debug/fastrpc HTTP/1.0\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.0 200"));
    assert!(response.contains("FastRPC Services"));
    assert!(response.contains("<b>Foo</b>"));
    assert!(response.contains("Sum"));
    assert!(response.contains("<td align=center>3</td>"));
}
