use futures::StreamExt;
use httpmock::prelude::*;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;

fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[test]
fn docker_host_normalization() {
    assert_eq!(normalize_docker_host("tcp://10.0.0.5:2375").unwrap(), "http://10.0.0.5:2375");
    assert_eq!(normalize_docker_host("http://localhost:2375/").unwrap(), "http://localhost:2375");
    assert_eq!(normalize_docker_host("localhost:2375").unwrap(), "http://localhost:2375");
    assert!(matches!(
        normalize_docker_host("unix:///var/run/docker.sock"),
        Err(RuntimeError::Unsupported(_))
    ));
}

#[tokio::test]
async fn inspect_maps_engine_fields() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/containers/c1/json");
            then.status(200).json_body(json!({
                "Id": "c1",
                "Name": "/web",
                "Created": "2024-01-01T00:00:00Z",
                "State": {
                    "Status": "running",
                    "StartedAt": "2024-01-01T00:00:01Z",
                    "Health": { "Status": "healthy" }
                },
                "Config": {
                    "Image": "nginx:1.25",
                    "Env": ["PATH=/usr/bin", "DB_PASSWORD=hunter2"],
                    "Labels": { "fleet.service_id": "svc-1" }
                },
                "NetworkSettings": {
                    "Ports": {
                        "80/tcp": [{ "HostIp": "0.0.0.0", "HostPort": "8080" }],
                        "443/tcp": null
                    }
                }
            }));
        })
        .await;

    let client = DockerClient::new(&server.base_url()).unwrap();
    let details = client.inspect("c1").await.unwrap();
    mock.assert_async().await;

    assert_eq!(details.name, "web");
    assert_eq!(details.image, "nginx:1.25");
    assert_eq!(details.status, "running");
    assert_eq!(details.health.as_deref(), Some("healthy"));
    assert_eq!(details.labels["fleet.service_id"], "svc-1");
    assert_eq!(details.env.len(), 2);
    assert_eq!(
        details.ports,
        vec![
            PortBinding {
                container_port: "443/tcp".into(),
                host_ip: None,
                host_port: None,
            },
            PortBinding {
                container_port: "80/tcp".into(),
                host_ip: Some("0.0.0.0".into()),
                host_port: Some("8080".into()),
            },
        ]
    );
}

#[tokio::test]
async fn inspect_missing_container_is_not_found() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/containers/gone/json");
            then.status(404)
                .json_body(json!({ "message": "No such container: gone" }));
        })
        .await;

    let client = DockerClient::new(&server.base_url()).unwrap();
    let err = client.inspect("gone").await.unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(id) if id == "gone"));
}

#[tokio::test]
async fn engine_error_message_is_surfaced() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/containers/json");
            then.status(500).json_body(json!({ "message": "daemon on fire" }));
        })
        .await;

    let client = DockerClient::new(&server.base_url()).unwrap();
    let err = client.list_containers(false).await.unwrap_err();
    match err {
        RuntimeError::Http { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "daemon on fire");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stats_sums_networks_and_reads_both_cpu_counters() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/containers/c1/stats")
                .query_param("stream", "false");
            then.status(200).json_body(json!({
                "cpu_stats": {
                    "cpu_usage": { "total_usage": 400, "percpu_usage": [200, 200] },
                    "system_cpu_usage": 2000
                },
                "precpu_stats": {
                    "cpu_usage": { "total_usage": 200 },
                    "system_cpu_usage": 1000,
                    "online_cpus": 2
                },
                "memory_stats": { "usage": 256, "limit": 1024 },
                "networks": {
                    "eth0": { "rx_bytes": 10, "tx_bytes": 20 },
                    "eth1": { "rx_bytes": 1, "tx_bytes": 2 }
                }
            }));
        })
        .await;

    let client = DockerClient::new(&server.base_url()).unwrap();
    let stats = client.stats("c1").await.unwrap();

    assert_eq!(
        stats,
        StatsSample {
            cpu: CpuCounters {
                total_usage: 400,
                system_usage: 2000,
                online_cpus: 2,
            },
            precpu: CpuCounters {
                total_usage: 200,
                system_usage: 1000,
                online_cpus: 2,
            },
            memory_usage: 256,
            memory_limit: 1024,
            rx_bytes: 11,
            tx_bytes: 22,
        }
    );
}

#[tokio::test]
async fn list_containers_strips_name_slash() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/containers/json")
                .query_param("all", "false");
            then.status(200).json_body(json!([
                { "Id": "c1", "Names": ["/web"], "Image": "nginx", "State": "running", "Status": "Up 2 minutes" }
            ]));
        })
        .await;

    let client = DockerClient::new(&server.base_url()).unwrap();
    let containers = client.list_containers(false).await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "web");
    assert_eq!(containers[0].state, "running");
}

#[tokio::test]
async fn events_stream_parses_ndjson_and_reports_bad_lines() {
    let server = MockServer::start_async().await;
    let body = concat!(
        r#"{"Type":"container","Action":"start","Actor":{"ID":"c1","Attributes":{"name":"web"}},"time":1700000000}"#,
        "\n",
        "not json\n",
        "\n",
        r#"{"Type":"container","Action":"health_status: healthy","Actor":{"ID":"c1","Attributes":{}},"time":1700000001}"#,
        "\n",
    );
    server
        .mock_async(|when, then| {
            when.method(GET).path("/events");
            then.status(200).body(body);
        })
        .await;

    let client = DockerClient::new(&server.base_url()).unwrap();
    let items: Vec<_> = client.events().await.unwrap().collect().await;

    assert_eq!(items.len(), 3);
    let first = items[0].as_ref().unwrap();
    assert_eq!(first.action, "start");
    assert_eq!(first.id, "c1");
    assert_eq!(first.attributes["name"], "web");
    assert!(matches!(items[1], Err(RuntimeError::Decode(_))));
    assert_eq!(items[2].as_ref().unwrap().action, "health_status: healthy");
}

#[tokio::test]
async fn logs_are_demultiplexed_into_lines() {
    let server = MockServer::start_async().await;
    let mut body = frame(1, b"2024-01-01T00:00:00.000000000Z INFO ready\n");
    body.extend(frame(2, b"2024-01-01T00:00:01.000000000Z ERROR boom\n"));
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/containers/c1/logs")
                .query_param("follow", "true")
                .query_param("timestamps", "true")
                .query_param("tail", "50");
            then.status(200).body(body);
        })
        .await;

    let client = DockerClient::new(&server.base_url()).unwrap();
    let options = LogOptions {
        follow: true,
        timestamps: true,
        tail: 50,
    };
    let lines: Vec<Vec<u8>> = client
        .logs("c1", options)
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    assert_eq!(
        lines,
        vec![
            b"2024-01-01T00:00:00.000000000Z INFO ready".to_vec(),
            b"2024-01-01T00:00:01.000000000Z ERROR boom".to_vec(),
        ]
    );
}
