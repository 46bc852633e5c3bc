//! Tests for address resolution

use std::net::{IpAddr, Ipv4Addr};
use tcpdup::address::{resolve, Endpoint};

#[tokio::test]
async fn test_resolve_host_port() {
    let addr = resolve("192.168.1.118:1234").await.expect("resolve failed");
    assert_eq!(addr.ip.to_string(), "192.168.1.118");
    assert_eq!(addr.port, 1234);
    assert_eq!(addr.zone, None);
}

#[tokio::test]
async fn test_resolve_bare_port_uses_wildcard() {
    let addr = resolve("8080").await.expect("resolve failed");
    assert_eq!(addr.ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    assert_eq!(addr.port, 8080);

    let addr = resolve(":9090").await.expect("resolve failed");
    assert_eq!(addr, Endpoint::wildcard(9090));
}

#[tokio::test]
async fn test_resolve_hostname() {
    let addr = resolve("localhost:8000").await.expect("localhost should resolve");
    assert!(addr.ip.is_loopback());
    assert_eq!(addr.port, 8000);
}

#[tokio::test]
async fn test_resolve_round_trips_through_display() {
    for text in [
        "127.0.0.1:80",
        "10.1.2.3:65535",
        "[::1]:8080",
        "[fe80::1%2]:443",
        "5000",
        "0.0.0.0:0",
    ] {
        let endpoint = resolve(text).await.unwrap_or_else(|| panic!("{} should resolve", text));
        let rendered = endpoint.to_string();
        let again = resolve(&rendered)
            .await
            .unwrap_or_else(|| panic!("{} should resolve", rendered));
        assert_eq!(endpoint, again, "{} -> {}", text, rendered);
    }
}

#[tokio::test]
async fn test_resolve_malformed_returns_none() {
    for text in [
        "",
        "   ",
        "abc",
        "127.0.0.1:",
        "127.0.0.1:port",
        "127.0.0.1:65536",
        "1:2:3",
        "[::1]",
        "[::1]:",
        "[fe80::1%]:80",
        "127.0.0.1%eth0:80",
        "-1",
        " 8080",
        "127.0.0.1:80 ",
    ] {
        assert!(resolve(text).await.is_none(), "{:?} should not resolve", text);
    }
}

#[test]
fn test_clone_has_independent_storage() {
    let original: Endpoint = "[fe80::1%4]:80".parse().unwrap();
    let mut copy = original.clone();

    copy.ip = "fe80::2".parse().unwrap();
    copy.port = 81;
    if let Some(zone) = copy.zone.as_mut() {
        zone.push('2');
    }

    assert_eq!(original.to_string(), "[fe80::1%4]:80");
    assert_eq!(copy.to_string(), "[fe80::2%42]:81");
}

#[test]
fn test_assign_overwrites_in_place() {
    let src: Endpoint = "192.168.1.128:1234".parse().unwrap();
    let mut dst: Endpoint = "[fe80::9%1]:5678".parse().unwrap();

    dst.assign(&src);

    assert_eq!(dst.ip.to_string(), "192.168.1.128");
    assert_eq!(dst.port, 1234);
    assert_eq!(dst.zone, None);
}

#[test]
fn test_socket_addr_conversion() {
    let endpoint: Endpoint = "127.0.0.1:4000".parse().unwrap();
    let addr = endpoint.to_socket_addr();
    assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    assert_eq!(Endpoint::from(addr), endpoint);
}
