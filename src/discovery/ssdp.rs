//! SSDP stream discovery
//!
//! Listens on the SSDP multicast group for announcements of the configured
//! service type and periodically searches for it. Every alive announcement
//! seeds (or replaces) an input stream named `"<name> (<instance_id>)"`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::StreamList;
use crate::capture::DeviceDescriptor;
use crate::config::DiscoveryConfig;

pub const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

/// Interval between M-SEARCH requests
const SEARCH_INTERVAL: Duration = Duration::from_secs(30);

const MAX_DATAGRAM: usize = 2048;

/// One parsed announcement or search response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub service_type: String,
    pub name: String,
    pub location: String,
    pub instance_id: String,
    pub alive: bool,
}

impl DiscoveryEvent {
    /// Name of the input stream this event seeds
    pub fn stream_name(&self) -> String {
        format!("{} ({})", self.name, self.instance_id)
    }

    pub fn descriptor(&self, timeout: Duration) -> DeviceDescriptor {
        DeviceDescriptor::stream(self.stream_name(), self.location.clone(), timeout)
    }
}

/// Parse a NOTIFY or an M-SEARCH response. Requests of other kinds and
/// messages without a location are ignored.
pub fn parse_message(text: &str) -> Option<DiscoveryEvent> {
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));
    let start = lines.next()?.trim();
    let is_notify = start.starts_with("NOTIFY ");
    let is_response = start.starts_with("HTTP/1.1 200");
    if !is_notify && !is_response {
        return None;
    }

    let mut service_type = None;
    let mut usn = None;
    let mut location = None;
    let mut name = None;
    let mut server = None;
    let mut nts = None;
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim().to_ascii_uppercase().as_str() {
            "NT" | "ST" => service_type = Some(value),
            "USN" => usn = Some(value),
            "LOCATION" => location = Some(value),
            "NAME" | "X-NAME" => name = Some(value),
            "SERVER" => server = Some(value),
            "NTS" => nts = Some(value),
            _ => {}
        }
    }

    let service_type = service_type?;
    let usn = usn?;
    let instance_id = usn
        .strip_prefix("uuid:")
        .unwrap_or(&usn)
        .split("::")
        .next()
        .unwrap_or_default()
        .to_string();
    let alive = !matches!(nts.as_deref(), Some("ssdp:byebye"));
    let location = location.unwrap_or_default();
    if alive && location.is_empty() {
        return None;
    }

    Some(DiscoveryEvent {
        name: name.or(server).unwrap_or_else(|| service_type.clone()),
        service_type,
        location,
        instance_id,
        alive,
    })
}

/// M-SEARCH request for `service_type`
pub fn search_request(service_type: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {}\r\n\
         \r\n",
        SSDP_GROUP, SSDP_PORT, service_type
    )
}

/// Apply one event to the stream list. Returns true if it was used.
pub fn apply_event(
    event: &DiscoveryEvent,
    config: &DiscoveryConfig,
    streams: &StreamList,
) -> bool {
    if event.service_type != config.service_type || !event.alive {
        return false;
    }
    let descriptor = event.descriptor(Duration::from_secs(config.stream_timeout_secs));
    tracing::debug!(
        stream = %descriptor.name,
        location = %descriptor.url,
        "SSDP video stream found"
    );
    streams.upsert(descriptor);
    true
}

/// Background SSDP listener
pub struct SsdpListener {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SsdpListener {
    /// Join the multicast group and start listening
    pub async fn spawn(config: DiscoveryConfig, streams: Arc<StreamList>) -> std::io::Result<Self> {
        let socket = bind_socket().await?;
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(listen(socket, config, streams, stop_rx));
        Ok(Self { stop, task })
    }

    pub async fn stop(self) {
        self.stop.send_replace(true);
        let _ = self.task.await;
    }
}

async fn bind_socket() -> std::io::Result<UdpSocket> {
    let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, SSDP_PORT));
    let socket = match UdpSocket::bind(any).await {
        Ok(socket) => socket,
        Err(e) => {
            // Another SSDP stack owns the port; search responses still arrive
            tracing::warn!(error = %e, "SSDP port busy, only search responses will be seen");
            UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?
        }
    };
    if let Err(e) = socket.join_multicast_v4(SSDP_GROUP, Ipv4Addr::UNSPECIFIED) {
        tracing::warn!(error = %e, "Cannot join SSDP multicast group");
    }
    Ok(socket)
}

async fn listen(
    socket: UdpSocket,
    config: DiscoveryConfig,
    streams: Arc<StreamList>,
    mut stop: watch::Receiver<bool>,
) {
    let group = SocketAddr::from((SSDP_GROUP, SSDP_PORT));
    let request = search_request(&config.service_type);
    let mut search = tokio::time::interval(SEARCH_INTERVAL);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    tracing::info!(service_type = %config.service_type, "SSDP discovery started");
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = search.tick() => {
                if let Err(e) = socket.send_to(request.as_bytes(), group).await {
                    tracing::debug!(error = %e, "SSDP search failed");
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, from)) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        if let Some(event) = parse_message(&text) {
                            tracing::trace!(from = %from, event = ?event, "SSDP message");
                            apply_event(&event, &config, &streams);
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "SSDP receive failed"),
                }
            }
        }
    }
    tracing::debug!("SSDP discovery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY: &str = "NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        NT: ugcs:video-source\r\n\
        NTS: ssdp:alive\r\n\
        USN: uuid:79cb1eb7::ugcs:video-source\r\n\
        LOCATION: rtsp://192.168.8.103:8083\r\n\
        X-NAME: DJI Android Video\r\n\
        \r\n";

    #[test]
    fn test_parse_notify() {
        let event = parse_message(NOTIFY).unwrap();
        assert_eq!(event.service_type, "ugcs:video-source");
        assert_eq!(event.instance_id, "79cb1eb7");
        assert_eq!(event.location, "rtsp://192.168.8.103:8083");
        assert!(event.alive);
        assert_eq!(event.stream_name(), "DJI Android Video (79cb1eb7)");
    }

    #[test]
    fn test_parse_search_response_and_byebye() {
        let response = "HTTP/1.1 200 OK\r\nST: ugcs:video-source\r\nUSN: uuid:abc\r\n\
            LOCATION: rtsp://10.0.0.2/live\r\nSERVER: Drone/1.0\r\n\r\n";
        let event = parse_message(response).unwrap();
        assert_eq!(event.name, "Drone/1.0");
        assert_eq!(event.instance_id, "abc");

        let bye = NOTIFY.replace("ssdp:alive", "ssdp:byebye");
        assert!(!parse_message(&bye).unwrap().alive);

        let search = search_request("ugcs:video-source");
        assert!(parse_message(&search).is_none());
    }

    #[test]
    fn test_apply_event() {
        let config = DiscoveryConfig::default();
        let streams = StreamList::default();
        let event = parse_message(NOTIFY).unwrap();

        assert!(apply_event(&event, &config, &streams));
        assert!(apply_event(&event, &config, &streams));
        let entries = streams.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "DJI Android Video (79cb1eb7)");
        assert_eq!(entries[0].timeout, Duration::from_secs(60));

        let other = DiscoveryEvent {
            service_type: "upnp:rootdevice".into(),
            ..event
        };
        assert!(!apply_event(&other, &config, &streams));
    }
}
