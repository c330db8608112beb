use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

use conntrack::tcp::flags;
use conntrack::FlowTable;
use conntrack::FlowTableConfig;

fn addrs() -> (IpAddr, IpAddr) {
    (
        IpAddr::V4(Ipv4Addr::new(100, 64, 0, 1)),
        IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2)),
    )
}

#[test]
fn blocks_unsolicited_inbound_security_cases() {
    let table = FlowTable::default();
    let (src, dst) = addrs();
    let (src_port, dst_port) = (12345u16, 80u16);

    let cases = [
        ("syn-ack", flags::SYN | flags::ACK),
        ("syn-fin", flags::SYN | flags::FIN),
        ("rst", flags::RST),
        ("ack", flags::ACK),
        ("ack-psh", flags::ACK | flags::PSH),
    ];

    for (name, f) in cases {
        assert!(
            !table.is_tcp_inbound_valid(dst, src, dst_port, src_port, f),
            "expected {name} to be rejected"
        );
    }
}

#[test]
fn normal_handshake_then_data() {
    let table = FlowTable::default();
    let (src, dst) = addrs();
    let (src_port, dst_port) = (12345u16, 80u16);

    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::SYN);
    assert!(table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::SYN | flags::ACK));
    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::ACK);
    assert!(table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::PSH | flags::ACK));
}

#[test]
fn normal_close_sequence() {
    let table = FlowTable::default();
    let (src, dst) = addrs();
    let (src_port, dst_port) = (12345u16, 80u16);

    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::SYN);
    table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::SYN | flags::ACK);
    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::ACK);

    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::FIN | flags::ACK);
    assert!(table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::ACK));
    assert!(table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::FIN | flags::ACK));
    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::ACK);
}

#[test]
fn rst_during_established_connection() {
    let table = FlowTable::default();
    let (src, dst) = addrs();
    let (src_port, dst_port) = (12345u16, 80u16);

    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::SYN);
    table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::SYN | flags::ACK);
    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::ACK);

    assert!(table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::RST));
}

#[test]
fn simultaneous_close() {
    let table = FlowTable::default();
    let (src, dst) = addrs();
    let (src_port, dst_port) = (12345u16, 80u16);

    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::SYN);
    table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::SYN | flags::ACK);
    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::ACK);

    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::FIN | flags::ACK);
    assert!(table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::FIN | flags::ACK));

    table.track_tcp_outbound(src, dst, src_port, dst_port, flags::ACK);
    assert!(table.is_tcp_inbound_valid(dst, src, dst_port, src_port, flags::ACK));
}

#[test]
fn unsolicited_syn_rejected_by_default_but_admitted_when_listening_allowed() {
    let (src, dst) = addrs();
    let strict = FlowTable::default();
    assert!(!strict.is_tcp_inbound_valid(dst, src, 80, 12345, flags::SYN));

    let listening = FlowTable::new(FlowTableConfig {
        allow_unsolicited_syn: true,
        ..FlowTableConfig::default()
    });
    assert!(listening.is_tcp_inbound_valid(dst, src, 80, 12345, flags::SYN));
}

#[test]
fn udp_requires_prior_outbound_and_has_no_unsolicited_allowance() {
    let table = FlowTable::default();
    let (src, dst) = addrs();

    assert!(!table.is_udp_inbound_valid(dst, src, 53, 40000));
    table.track_udp_outbound(src, dst, 40000, 53);
    assert!(table.is_udp_inbound_valid(dst, src, 53, 40000));
}

#[test]
fn icmp_requires_matching_echo_id_and_seq() {
    let table = FlowTable::default();
    let (src, dst) = addrs();

    table.track_icmp_outbound(src, dst, 7, 1);
    assert!(table.is_icmp_inbound_valid(dst, src, 7, 1));
    assert!(!table.is_icmp_inbound_valid(dst, src, 7, 2));
}

#[test]
fn cleanup_evicts_idle_flows() {
    let table = FlowTable::new(FlowTableConfig {
        tcp_established_timeout: std::time::Duration::from_millis(10),
        tcp_closing_timeout: std::time::Duration::from_millis(10),
        udp_timeout: std::time::Duration::from_millis(10),
        icmp_timeout: std::time::Duration::from_millis(10),
        ..FlowTableConfig::default()
    });
    let (src, dst) = addrs();

    table.track_udp_outbound(src, dst, 1234, 53);
    assert_eq!(table.udp_flow_count(), 1);

    thread::sleep(std::time::Duration::from_millis(30));
    table.cleanup();

    assert_eq!(table.udp_flow_count(), 0);
    assert!(!table.is_udp_inbound_valid(dst, src, 53, 1234));
}

#[test]
fn concurrent_disjoint_flows_are_independent() {
    let table = Arc::new(FlowTable::default());
    let mut handles = Vec::new();

    for i in 0u16..64 {
        let table = table.clone();
        handles.push(thread::spawn(move || {
            let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
            let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
            table.track_tcp_outbound(src, dst, 20000 + i, 443, flags::SYN);
            let valid = table.is_tcp_inbound_valid(dst, src, 443, 20000 + i, flags::SYN | flags::ACK);
            assert!(valid);
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(table.tcp_flow_count(), 64);
}
