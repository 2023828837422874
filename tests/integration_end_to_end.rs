//! Exercises the public API over a real TCP transport: two clients register domain descriptors,
//! write disjoint field parts and flush, and the server's aggregation-then-sink chain writes one
//! reassembled global field to disk.

use fieldmux::config::{
    ActionConfig, Config, DistributionKind, OnSinkError, PlanConfig, ServerGroupConfig,
    SinkConfig, TransportKind,
};
use fieldmux::dispatcher::{run_server, Dispatcher};
use fieldmux::domain::DomainMapRegistry;
use fieldmux::metadata::Metadata;
use fieldmux::transport::TransportFactory;
use fieldmux::{FieldmuxClient, Peer, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(server_port: u16, sink_path: &std::path::Path) -> Config {
    Config {
        transport: TransportKind::Tcp,
        group: "clients".to_string(),
        count: 2,
        servers: vec![ServerGroupConfig {
            host: "127.0.0.1".to_string(),
            ports: vec![server_port],
        }],
        plans: vec![PlanConfig {
            name: "ocean".to_string(),
            actions: vec![
                ActionConfig::Aggregation,
                ActionConfig::Sink {
                    sinks: vec![SinkConfig::File {
                        path: sink_path.to_string_lossy().to_string(),
                    }],
                    on_error: OnSinkError::Abort,
                },
            ],
        }],
        hash_keys: vec!["category".into(), "name".into(), "level".into()],
        distribution: DistributionKind::HashedToSingle,
        used_server_count: 1,
    }
}

fn field_metadata() -> Metadata {
    let mut m = Metadata::new();
    m.set("category", "ocean");
    m.set("name", "sst");
    m.set("level", 1_i64);
    m.set("domain", "grid");
    m.set("level_count", 1_i64);
    m
}

#[tokio::test]
async fn two_clients_aggregate_into_one_global_field_on_disk() {
    let sink_dir = tempfile::tempdir().unwrap();
    let sink_path = sink_dir.path().join("out.bin");

    let server_port = free_port().await;
    let config = test_config(server_port, &sink_path);
    let server_peer = Peer::new("server", 0);

    let server_transport: Arc<dyn Transport> = Arc::from(
        TransportFactory::create(
            config.transport,
            server_peer.clone(),
            vec![server_peer.clone()],
            config.count,
            "127.0.0.1",
            server_port,
        )
        .await
        .unwrap(),
    );
    let domain_maps = Arc::new(DomainMapRegistry::new());
    let dispatcher = Dispatcher::from_config(&config, domain_maps.clone()).unwrap();
    let server_task = tokio::spawn(run_server(
        server_transport,
        dispatcher,
        domain_maps,
        config.count,
    ));

    let client0_port = free_port().await;
    let client0 = FieldmuxClient::new(&config, "127.0.0.1", client0_port, 0)
        .await
        .unwrap();
    client0.open().await.unwrap();
    client0
        .write_domain("grid", 8, vec![0, 1, 2, 3], 2)
        .await
        .unwrap();

    let client1_port = free_port().await;
    let client1 = FieldmuxClient::new(&config, "127.0.0.1", client1_port, 1)
        .await
        .unwrap();
    client1.open().await.unwrap();
    client1
        .write_domain("grid", 8, vec![4, 5, 6, 7], 2)
        .await
        .unwrap();

    client0
        .write_field(field_metadata(), &[10.0, 11.0, 12.0, 13.0])
        .await
        .unwrap();
    client1
        .write_field(field_metadata(), &[20.0, 21.0, 22.0, 23.0])
        .await
        .unwrap();

    client0.flush(field_metadata()).await.unwrap();
    client1.flush(field_metadata()).await.unwrap();

    client0.close().await.unwrap();
    client1.close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server loop did not stop after both clients closed")
        .unwrap()
        .unwrap();

    let written = std::fs::read(&sink_path).unwrap();
    let values: Vec<f64> = written
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(values, vec![10.0, 11.0, 12.0, 13.0, 20.0, 21.0, 22.0, 23.0]);
}

#[tokio::test]
async fn server_stops_once_every_client_closes_with_no_fields_written() {
    let sink_dir = tempfile::tempdir().unwrap();
    let sink_path = sink_dir.path().join("out.bin");

    let server_port = free_port().await;
    let config = test_config(server_port, &sink_path);
    let server_peer = Peer::new("server", 0);

    let server_transport: Arc<dyn Transport> = Arc::from(
        TransportFactory::create(
            config.transport,
            server_peer.clone(),
            vec![server_peer.clone()],
            config.count,
            "127.0.0.1",
            server_port,
        )
        .await
        .unwrap(),
    );
    let domain_maps = Arc::new(DomainMapRegistry::new());
    let dispatcher = Dispatcher::from_config(&config, domain_maps.clone()).unwrap();
    let server_task = tokio::spawn(run_server(
        server_transport,
        dispatcher,
        domain_maps,
        config.count,
    ));

    for id in 0..2 {
        let port = free_port().await;
        let client = FieldmuxClient::new(&config, "127.0.0.1", port, id).await.unwrap();
        client.open().await.unwrap();
        client.close().await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server loop did not stop after both clients closed")
        .unwrap()
        .unwrap();

    assert!(!sink_path.exists());
}
