use std::net::IpAddr;

/// Transport-layer protocol a [`FlowKey`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// 5-tuple identity of a flow, stored as observed on the outbound direction.
///
/// Inbound validation swaps `src`/`dst` before looking the key up, so a flow
/// opened by an outbound packet from A to B is always keyed `(A, B)`
/// regardless of which direction a later packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(
        protocol: Protocol,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// The key as it would be observed travelling in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// Like [`reversed`](Self::reversed), but swaps only the IP addresses and
    /// leaves the port fields untouched. ICMP has no transport ports: it
    /// packs the echo `id` into `src_port` and a fixed `0` into `dst_port`
    /// (see `track_icmp_outbound`) rather than using those fields
    /// directionally, so recovering the stored key for a reply only ever
    /// requires flipping which IP is which.
    pub fn reversed_ip_only(&self) -> Self {
        Self {
            protocol: self.protocol,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }
}
