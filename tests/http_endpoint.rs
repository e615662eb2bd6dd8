//! Scrapes the metrics endpoint over a real TCP socket

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus_sink::{
    exporter::{ExporterConfig, PrometheusExporter},
    types::{op_code, MetricKind, OperationRecord},
    InstrumentRegistry, MetricsServer, OperationDispatcher,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn start_server() -> (Arc<OperationDispatcher>, MetricsServer, SocketAddr) {
    let registry = Arc::new(InstrumentRegistry::default());
    let dispatcher = Arc::new(OperationDispatcher::new(registry));
    let exporter = Arc::new(PrometheusExporter::new(
        ExporterConfig::default(),
        Arc::clone(&dispatcher),
    )
    .unwrap());
    let server = MetricsServer::new(exporter);
    let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (dispatcher, server, addr)
}

#[tokio::test]
async fn test_scrape_reflects_live_state() {
    let (dispatcher, server, addr) = start_server().await;

    dispatcher.dispatch(
        &OperationRecord::new("requests_total", MetricKind::Counter, op_code::ADD, 3.0)
            .with_label("route", "/a"),
    );
    let response = http_get(addr, "/metrics").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response
        .to_ascii_lowercase()
        .contains("content-type: text/plain; version=0.0.4"));
    assert!(response.contains("requests_total{route=\"/a\"} 3"));

    // No caching between scrapes
    dispatcher.dispatch(
        &OperationRecord::new("requests_total", MetricKind::Counter, op_code::INC, 0.0)
            .with_label("route", "/a"),
    );
    let response = http_get(addr, "/metrics").await;
    assert!(response.contains("requests_total{route=\"/a\"} 4"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_any_path_serves_metrics() {
    let (_dispatcher, server, addr) = start_server().await;

    let response = http_get(addr, "/custom/scrape/path").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("prometheus_sink_operations_applied_total 0"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_health() {
    let (_dispatcher, server, addr) = start_server().await;

    let response = http_get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"healthy\""));

    server.shutdown().await;
}
