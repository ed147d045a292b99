//! UDP transport tests against an in-process fake relay

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

use rvoip_rtpproxy_client::address::{resolve, ProxySpec};
use rvoip_rtpproxy_client::{
    Capabilities, RtpProxyClient, RtpProxyConfig, RtpProxyTransport, UdpTransport,
};

fn relay_reply(command: &str) -> String {
    match command {
        "V" => "20040107".to_string(),
        "VF 20081224" | "VF 20090810" => "1".to_string(),
        c if c.starts_with("VF ") => "0".to_string(),
        "Ib" => "sessions created: 4\nactive sessions: 2\nactive streams: 4\npackets received: 10\npackets transmitted: 9".to_string(),
        _ => "E1".to_string(),
    }
}

/// Relay answering every `<cookie> <command>` datagram immediately
async fn spawn_relay() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else { break };
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            let Some((cookie, command)) = text.split_once(' ') else { continue };
            let reply = format!("{} {}\n", cookie, relay_reply(command.trim()));
            let _ = socket.send_to(reply.as_bytes(), src).await;
        }
    });

    addr
}

async fn udp_transport(relay: SocketAddr, config: &RtpProxyConfig) -> UdpTransport {
    let endpoint = resolve(&ProxySpec::Spec(format!("udp:{}", relay)), "127.0.0.1")
        .await
        .unwrap();
    UdpTransport::bind(&endpoint, config).await.unwrap()
}

async fn send(transport: &UdpTransport, command: &str) -> Option<String> {
    let (tx, rx) = oneshot::channel();
    transport.send_command(
        command,
        Box::new(move |reply| {
            let _ = tx.send(reply);
        }),
    );
    timeout(Duration::from_secs(5), rx).await.unwrap().unwrap()
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_udp_command_roundtrip() {
    let relay = spawn_relay().await;
    let transport = udp_transport(relay, &RtpProxyConfig::default()).await;

    assert_eq!(send(&transport, "V").await.as_deref(), Some("20040107"));
    assert_eq!(send(&transport, "VF 20090810").await.as_deref(), Some("1"));
    assert_eq!(transport.pending_commands(), 0);
    assert!(transport.rtpc_delay().is_some());
    assert!(!transport.is_local());
}

#[tokio::test]
async fn test_udp_replies_matched_out_of_order() {
    let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay = relay_socket.local_addr().unwrap();
    let transport = udp_transport(relay, &RtpProxyConfig::default()).await;

    let (tx_a, rx_a) = oneshot::channel();
    let (tx_b, rx_b) = oneshot::channel();
    transport.send_command("A", Box::new(move |r| { let _ = tx_a.send(r); }));
    transport.send_command("B", Box::new(move |r| { let _ = tx_b.send(r); }));

    // Collect both requests, then answer the second one first
    let mut buf = vec![0u8; 1024];
    let mut requests = Vec::new();
    while requests.len() < 2 {
        let (len, src) = relay_socket.recv_from(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..len]).to_string();
        let (cookie, command) = text.split_once(' ').unwrap();
        requests.push((cookie.to_string(), command.to_string(), src));
    }
    for (cookie, command, src) in requests.iter().rev() {
        let reply = format!("{} reply-{}", cookie, command);
        relay_socket.send_to(reply.as_bytes(), src).await.unwrap();
    }

    assert_eq!(rx_b.await.unwrap().as_deref(), Some("reply-B"));
    assert_eq!(rx_a.await.unwrap().as_deref(), Some("reply-A"));
}

#[tokio::test]
async fn test_udp_gives_up_after_retransmissions() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay = silent.local_addr().unwrap();
    let mut config = RtpProxyConfig::default();
    config.udp_retransmit_interval_ms = 20;
    config.udp_max_retransmits = 2;
    let transport = udp_transport(relay, &config).await;

    assert_eq!(send(&transport, "Ib").await, None);
    assert_eq!(transport.pending_commands(), 0);

    // Original datagram plus two retransmissions, all with the same cookie
    let mut buf = vec![0u8; 1024];
    let mut cookies = Vec::new();
    for _ in 0..3 {
        let (len, _) = timeout(Duration::from_secs(1), silent.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&buf[..len]).to_string();
        cookies.push(text.split_once(' ').unwrap().0.to_string());
    }
    assert!(cookies.iter().all(|c| *c == cookies[0]));
}

#[tokio::test]
async fn test_udp_shutdown_fails_pending_and_new_commands() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let transport = udp_transport(silent.local_addr().unwrap(), &RtpProxyConfig::default()).await;

    let (tx, rx) = oneshot::channel();
    transport.send_command("V", Box::new(move |r| { let _ = tx.send(r); }));
    transport.shutdown();
    transport.shutdown();

    assert_eq!(rx.await.unwrap(), None);
    assert_eq!(send(&transport, "V").await, None);
}

#[tokio::test]
async fn test_client_goes_online_over_udp() {
    let relay = spawn_relay().await;
    let config = RtpProxyConfig::new(format!("udp:{}", relay))
        .with_heartbeat_interval(Duration::from_millis(50));
    let client = RtpProxyClient::new(config).await.unwrap();

    assert_eq!(client.proxy_address(), "127.0.0.1");
    let probe = client.clone();
    wait_for(move || probe.caps_done() && probe.stats().is_some()).await;

    assert!(client.is_online());
    assert_eq!(
        client.capabilities(),
        Capabilities {
            copy: false,
            stat: false,
            tnot: true,
            sbind: true,
            wdnt: false,
        }
    );
    let stats = client.stats().unwrap();
    assert_eq!(stats.active_sessions, 2);
    assert_eq!(stats.packets_transmitted, 9);
    assert_eq!(client.command("X").await.as_deref(), Some("E1"));

    client.shutdown();
    assert!(client.is_shut_down());
    assert_eq!(client.command("V").await, None);
}

#[tokio::test]
async fn test_client_goes_offline_when_relay_stops_answering() {
    let relay_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let relay = relay_socket.local_addr().unwrap();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    // Answers normally until told to stop, then goes silent
    let socket = relay_socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let mut silent = false;
        loop {
            let (len, src) = socket.recv_from(&mut buf).await.unwrap();
            if !silent && stop_rx.try_recv().is_ok() {
                silent = true;
            }
            if silent {
                continue;
            }
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            let (cookie, command) = text.split_once(' ').unwrap();
            let reply = format!("{} {}", cookie, relay_reply(command.trim()));
            let _ = socket.send_to(reply.as_bytes(), src).await;
        }
    });

    let mut config = RtpProxyConfig::new(format!("udp:{}", relay))
        .with_heartbeat_interval(Duration::from_millis(20));
    config.udp_retransmit_interval_ms = 10;
    config.udp_max_retransmits = 1;
    let client = RtpProxyClient::new(config).await.unwrap();

    let probe = client.clone();
    wait_for(move || probe.is_online()).await;

    stop_tx.send(()).unwrap();
    let probe = client.clone();
    wait_for(move || !probe.is_online()).await;
    assert_eq!(client.stats(), None);

    client.shutdown();
}
