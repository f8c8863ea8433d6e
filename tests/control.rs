//! End-to-end tests over the control port

use std::net::IpAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use vstreamer::{ControlServer, StreamerConfig};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start(folder: &std::path::Path) -> ControlServer {
    let config = StreamerConfig::default()
        .server_port(free_port().await)
        .bind_addresses(vec![IpAddr::from([127, 0, 0, 1])])
        .autodetect(false)
        .saved_video_folder(folder)
        .input_stream("Test;synthetic://test?fps=50");
    ControlServer::start(&config).await.unwrap()
}

/// Send a raw request and return (status, body)
async fn request(port: u16, raw: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    // A dropped request may end in a reset instead of a clean close
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
        .await
        .expect("response timed out");
    let text = String::from_utf8_lossy(&out).into_owned();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn get(port: u16, path: &str) -> (u16, String) {
    request(port, &format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path)).await
}

async fn send_json(port: u16, method: &str, path: &str, body: &str) -> (u16, String) {
    request(
        port,
        &format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        ),
    )
    .await
}

async fn streams(port: u16) -> Vec<Value> {
    let (status, body) = get(port, "/streams").await;
    assert_eq!(status, 200);
    serde_json::from_str::<Value>(&body)
        .unwrap()
        .as_array()
        .unwrap()
        .clone()
}

#[tokio::test]
async fn test_streams_and_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let port = server.port();

    let list = streams(port).await;
    assert_eq!(list.len(), 1);
    let entry = &list[0];
    assert_eq!(entry["name"], "Test");
    assert_eq!(entry["index"], "0");
    assert_eq!(entry["type"], 1);
    assert_eq!(entry["is_recording_active"], false);
    assert_eq!(entry["video_id"], "");
    assert_eq!(entry["last_recording_error_code"], "");
    assert!(entry["port"].as_u64().unwrap() > port as u64);

    let outer = entry["outer_streams"].as_array().unwrap();
    assert_eq!(outer.len(), 3);
    assert!(outer.iter().all(|o| o.get("error_code").is_none()));

    let (status, body) = get(port, "/parameters").await;
    assert_eq!(status, 200);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["autodetect"], false);

    let (status, _) = send_json(port, "PUT", "/parameters", r#"{"autodetect": true}"#).await;
    assert_eq!(status, 200);
    let (_, body) = get(port, "/parameters").await;
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["autodetect"], true);

    let (status, body) = get(port, "/").await;
    assert_eq!(status, 200);
    assert!(body.contains("<a href=\"/streams\">"));

    server.stop().await;
}

#[tokio::test]
async fn test_missing_videos() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let port = server.port();

    assert_eq!(get(port, "/download/missingvideo").await, (400, "1".to_string()));
    assert_eq!(get(port, "/video/missingvideo").await, (400, "1".to_string()));
    assert_eq!(
        request(port, "DELETE /video/missingvideo HTTP/1.1\r\n\r\n").await,
        (400, "1".to_string())
    );

    let (status, body) = get(port, "/playback?video_id=missingvideo").await;
    assert_eq!(status, 400);
    assert!(body.starts_with("File ") && body.ends_with(" not found."));
    assert_eq!(
        get(port, "/playback?pos=10").await,
        (400, "Bad query parameters".to_string())
    );

    server.stop().await;
}

#[tokio::test]
async fn test_recording_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let port = server.port();
    let device_port = streams(port).await[0]["port"].as_u64().unwrap();

    let start_body = format!(
        r#"{{"port": {}, "is_recording_active": true, "video_id": "flight"}}"#,
        device_port
    );
    assert_eq!(send_json(port, "PUT", "/stream", &start_body).await.0, 200);
    assert_eq!(
        send_json(port, "PUT", "/stream", &start_body).await,
        (400, "4".to_string())
    );

    let entry = &streams(port).await[0];
    assert_eq!(entry["is_recording_active"], true);
    assert_eq!(entry["video_id"], "flight");

    let (status, body) = get(port, "/video/flight").await;
    assert_eq!(status, 200);
    assert!(serde_json::from_str::<Value>(&body).unwrap()["duration"].is_null());
    assert_eq!(
        request(port, "DELETE /video/flight HTTP/1.1\r\n\r\n").await,
        (400, "4".to_string())
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stop_body = format!(r#"{{"port": {}, "is_recording_active": false}}"#, device_port);
    assert_eq!(send_json(port, "PUT", "/stream", &stop_body).await.0, 200);
    assert_eq!(streams(port).await[0]["video_id"], "");

    let (status, body) = get(port, "/video/flight").await;
    assert_eq!(status, 200);
    assert!(serde_json::from_str::<Value>(&body).unwrap()["duration"].as_i64().unwrap() >= 0);

    // Same id again
    assert_eq!(
        send_json(port, "PUT", "/stream", &start_body).await,
        (400, "2".to_string())
    );
    assert_eq!(streams(port).await[0]["last_recording_error_code"], "2");

    let (status, body) = get(port, "/download/flight").await;
    assert_eq!(status, 200);
    assert!(body.contains("FLV"));
    assert!(body.ends_with("0\r\n\r\n"));

    let (status, body) = get(port, "/playback?video_id=flight&speed=4").await;
    assert_eq!(status, 200);
    assert!(body.contains("Content-Type: image/jpeg"));

    // Out-of-range offsets and speeds still end the stream
    let (status, _) =
        get(port, "/playback?video_id=flight&pos=9223372036854775807&speed=1e300").await;
    assert_eq!(status, 200);
    let (status, body) = get(port, "/playback?video_id=flight&pos=-10&speed=1e300").await;
    assert_eq!(status, 200);
    assert!(body.contains("Content-Type: image/jpeg"));

    assert_eq!(
        request(port, "DELETE /video/flight HTTP/1.1\r\n\r\n").await.0,
        200
    );
    assert_eq!(get(port, "/video/flight").await, (400, "1".to_string()));

    server.stop().await;
}

#[tokio::test]
async fn test_recording_errors() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let port = server.port();
    let device_port = streams(port).await[0]["port"].as_u64().unwrap();

    let unknown = r#"{"port": 1, "is_recording_active": true, "video_id": "x"}"#;
    assert_eq!(send_json(port, "PUT", "/stream", unknown).await, (400, "3".to_string()));

    let no_id = format!(r#"{{"port": {}, "is_recording_active": true}}"#, device_port);
    assert_eq!(send_json(port, "PUT", "/stream", &no_id).await, (400, "1".to_string()));

    server.stop().await;
}

#[tokio::test]
async fn test_failed_recording_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let port = server.port();
    let device_port = streams(port).await[0]["port"].as_u64().unwrap();

    let start_body = format!(
        r#"{{"port": {}, "is_recording_active": true, "video_id": "broken"}}"#,
        device_port
    );
    assert_eq!(send_json(port, "PUT", "/stream", &start_body).await.0, 200);

    // Replace the sidecar with a directory so the next write fails
    let sidecar = dir.path().join("broken.flv.md");
    // The writer may recreate the file between the two calls
    loop {
        let _ = std::fs::remove_file(&sidecar);
        if std::fs::create_dir(&sidecar).is_ok() {
            break;
        }
    }

    let entry = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let entry = streams(port).await[0].clone();
            if entry["is_recording_active"] == false {
                break entry;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("recording never failed");
    assert_eq!(entry["video_id"], "");
    assert_eq!(entry["last_recording_error_code"], "6");

    server.stop().await;
}

#[tokio::test]
async fn test_outer_streams() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let port = server.port();
    let device_port = streams(port).await[0]["port"].as_u64().unwrap();

    let (status, body) = send_json(port, "POST", "/outerstream", r#"{"port": 1}"#).await;
    assert_eq!((status, body.as_str()), (400, "No outer streams send for 1"));

    let (status, body) =
        send_json(port, "POST", "/outerstream", r#"{"port": 1, "streams": []}"#).await;
    assert_eq!(status, 400);
    assert!(body.contains("No devices with port 1"));

    let bad_type = format!(
        r#"{{"port": {}, "streams": [{{"type": "vimeo", "url": "rtmp://x/y", "is_active": true}}]}}"#,
        device_port
    );
    assert_eq!(
        send_json(port, "POST", "/outerstream", &bad_type).await,
        (400, "Unsupported stream type <vimeo>".to_string())
    );

    let bad_url = format!(
        r#"{{"port": {}, "streams": [{{"type": "ustream", "url": "not a url", "is_active": true}}]}}"#,
        device_port
    );
    assert_eq!(send_json(port, "POST", "/outerstream", &bad_url).await.0, 200);

    let entry = &streams(port).await[0];
    let ustream = entry["outer_streams"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["type"] == "ustream")
        .unwrap()
        .clone();
    assert_eq!(ustream["url"], "not a url");
    assert_eq!(ustream["state"], 4);
    assert_eq!(ustream["error_code"], 5);

    server.stop().await;
}

#[tokio::test]
async fn test_body_without_length_gets_no_response() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;

    let (status, body) = request(
        server.port(),
        "PUT /parameters HTTP/1.1\r\nHost: localhost\r\n\r\n{\"autodetect\": true}",
    )
    .await;
    assert_eq!((status, body.as_str()), (0, ""));
    assert!(!server.registry().params().autodetect());

    server.stop().await;
}

#[tokio::test]
async fn test_live_stream_port() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let device_port = streams(server.port()).await[0]["port"].as_u64().unwrap() as u16;

    let mut viewer = TcpStream::connect(("127.0.0.1", device_port)).await.unwrap();
    viewer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while !String::from_utf8_lossy(&out).contains("X-Timestamp") {
        let n = tokio::time::timeout(Duration::from_secs(5), viewer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        out.extend_from_slice(&buf[..n]);
    }
    assert!(String::from_utf8_lossy(&out).contains("multipart/x-mixed-replace"));

    drop(viewer);
    server.stop().await;
}
