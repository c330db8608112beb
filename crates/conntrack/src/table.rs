use std::net::IpAddr;
use std::time::Duration;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::icmp::IcmpFlow;
use crate::icmp::ICMP_TIMEOUT;
use crate::key::FlowKey;
use crate::key::Protocol;
use crate::tcp;
use crate::tcp::Direction;
use crate::tcp::TcpFlow;
use crate::tcp::TcpState;
use crate::udp::UdpFlow;
use crate::udp::UDP_TIMEOUT;

#[derive(Debug, Clone, Copy)]
struct FlowEntry<V> {
    value: V,
    last_seen: Instant,
}

/// Configuration for a [`FlowTable`]; all fields have the spec's design
/// defaults (spec.md §4.1).
#[derive(Debug, Clone, Copy)]
pub struct FlowTableConfig {
    /// Whether a bare inbound SYN with no matching flow is admitted as a new
    /// server-side connection (spec.md §4.2, "if policy allows listening").
    /// Off by default: the strict policy this engine implements for a
    /// client-side NAT-traversal firewall is outbound-initiated-only.
    pub allow_unsolicited_syn: bool,
    pub tcp_established_timeout: Duration,
    pub tcp_closing_timeout: Duration,
    pub udp_timeout: Duration,
    pub icmp_timeout: Duration,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            allow_unsolicited_syn: false,
            tcp_established_timeout: tcp::ESTABLISHED_TIMEOUT,
            tcp_closing_timeout: tcp::CLOSING_TIMEOUT,
            udp_timeout: UDP_TIMEOUT,
            icmp_timeout: ICMP_TIMEOUT,
        }
    }
}

/// A concurrent, sharded 5-tuple flow table.
///
/// Backed by [`DashMap`], whose own internal shard array satisfies the
/// "shard by hash of key" recommendation (spec.md §9) without a hand-rolled
/// shard vector; readers never observe a torn [`FlowEntry`] because all
/// mutation happens through a single `DashMap` entry API call.
pub struct FlowTable {
    tcp: DashMap<FlowKey, FlowEntry<TcpFlow>>,
    udp: DashMap<FlowKey, FlowEntry<UdpFlow>>,
    icmp: DashMap<FlowKey, FlowEntry<IcmpFlow>>,
    config: FlowTableConfig,
}

impl FlowTable {
    pub fn new(config: FlowTableConfig) -> Self {
        Self {
            tcp: DashMap::new(),
            udp: DashMap::new(),
            icmp: DashMap::new(),
            config,
        }
    }

    // ---- TCP ----------------------------------------------------------

    pub fn track_tcp_outbound(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        flags: u8,
    ) {
        let key = FlowKey::new(Protocol::Tcp, src_ip, dst_ip, src_port, dst_port);
        let now = Instant::now();

        match self.tcp.entry(key) {
            Entry::Vacant(v) => {
                let state = if tcp::admits_unsolicited_inbound(flags) {
                    TcpState::SynSent
                } else {
                    // Outbound traffic from our own side is trusted even if
                    // we missed the SYN (e.g. the tracker started mid-flow).
                    TcpState::Established
                };
                v.insert(FlowEntry {
                    value: TcpFlow::new(state),
                    last_seen: now,
                });
            }
            Entry::Occupied(mut o) => {
                let entry = o.get_mut();
                let (new_state, _) = tcp::transition(entry.value.state, Direction::Outbound, flags);
                if let Some(state) = new_state {
                    entry.value.state = state;
                }
                entry.last_seen = entry.last_seen.max(now);
            }
        }
    }

    pub fn is_tcp_inbound_valid(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        flags: u8,
    ) -> bool {
        let stored_key = FlowKey::new(Protocol::Tcp, src_ip, dst_ip, src_port, dst_port).reversed();
        let now = Instant::now();

        if let Some(mut entry) = self.tcp.get_mut(&stored_key) {
            if !self.tcp_expired(&entry, now) {
                let (new_state, accepted) =
                    tcp::transition(entry.value.state, Direction::Inbound, flags);
                if accepted {
                    if let Some(state) = new_state {
                        entry.value.state = state;
                    }
                    entry.last_seen = entry.last_seen.max(now);
                }
                return accepted;
            }
        }

        if self.config.allow_unsolicited_syn && tcp::admits_unsolicited_inbound(flags) {
            self.tcp.insert(
                stored_key,
                FlowEntry {
                    value: TcpFlow::new(TcpState::SynReceived),
                    last_seen: now,
                },
            );
            return true;
        }

        false
    }

    fn tcp_expired(&self, entry: &FlowEntry<TcpFlow>, now: Instant) -> bool {
        let timeout = if entry.value.state.is_established() {
            self.config.tcp_established_timeout
        } else {
            self.config.tcp_closing_timeout
        };
        now.saturating_duration_since(entry.last_seen) >= timeout
    }

    // ---- UDP ------------------------------------------------------------

    pub fn track_udp_outbound(&self, src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16) {
        let key = FlowKey::new(Protocol::Udp, src_ip, dst_ip, src_port, dst_port);
        let now = Instant::now();
        self.udp
            .entry(key)
            .and_modify(|e| e.last_seen = e.last_seen.max(now))
            .or_insert(FlowEntry {
                value: UdpFlow,
                last_seen: now,
            });
    }

    pub fn is_udp_inbound_valid(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
    ) -> bool {
        let stored_key = FlowKey::new(Protocol::Udp, src_ip, dst_ip, src_port, dst_port).reversed();
        let now = Instant::now();

        match self.udp.get_mut(&stored_key) {
            Some(mut entry) if now.saturating_duration_since(entry.last_seen) < self.config.udp_timeout => {
                entry.last_seen = entry.last_seen.max(now);
                true
            }
            _ => false,
        }
    }

    // ---- ICMP -----------------------------------------------------------

    pub fn track_icmp_outbound(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        id: u16,
        seq: u16,
    ) {
        let key = FlowKey::new(Protocol::Icmp, src_ip, dst_ip, id, 0);
        let now = Instant::now();
        self.icmp.insert(
            key,
            FlowEntry {
                value: IcmpFlow::new(id, seq),
                last_seen: now,
            },
        );
    }

    pub fn is_icmp_inbound_valid(&self, src_ip: IpAddr, dst_ip: IpAddr, id: u16, seq: u16) -> bool {
        let stored_key = FlowKey::new(Protocol::Icmp, src_ip, dst_ip, id, 0).reversed_ip_only();
        let now = Instant::now();

        match self.icmp.get_mut(&stored_key) {
            Some(mut entry)
                if now.saturating_duration_since(entry.last_seen) < self.config.icmp_timeout
                    && entry.value.matches_reply(id, seq) =>
            {
                entry.last_seen = entry.last_seen.max(now);
                true
            }
            _ => false,
        }
    }

    // ---- Cleanup ----------------------------------------------------------

    /// Evicts entries idle past their protocol/state timeout. Walks each
    /// shard independently (via `DashMap::retain`), so it never takes a
    /// single global lock across the whole table.
    pub fn cleanup(&self) {
        let now = Instant::now();

        let established_timeout = self.config.tcp_established_timeout;
        let closing_timeout = self.config.tcp_closing_timeout;
        self.tcp.retain(|_, entry| {
            let timeout = if entry.value.state.is_established() {
                established_timeout
            } else {
                closing_timeout
            };
            now.saturating_duration_since(entry.last_seen) < timeout
        });

        let udp_timeout = self.config.udp_timeout;
        self.udp
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) < udp_timeout);

        let icmp_timeout = self.config.icmp_timeout;
        self.icmp
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) < icmp_timeout);
    }

    pub fn tcp_flow_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp.len()
    }

    pub fn icmp_flow_count(&self) -> usize {
        self.icmp.len()
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new(FlowTableConfig::default())
    }
}

/// Spawns a background task that periodically calls [`FlowTable::cleanup`].
/// Returns a handle that, when dropped, stops the sweeper.
pub fn spawn_cleanup_sweeper(
    table: std::sync::Arc<FlowTable>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            table.cleanup();
            tracing::trace!(
                tcp = table.tcp_flow_count(),
                udp = table.udp_flow_count(),
                icmp = table.icmp_flow_count(),
                "Flow table cleanup swept"
            );
        }
    })
}
