use std::time::Duration;

/// Bitflags of a TCP segment's control bits, as relevant to conntrack.
pub mod flags {
    pub const SYN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const FIN: u8 = 0b0000_0100;
    pub const RST: u8 = 0b0000_1000;
    pub const PSH: u8 = 0b0001_0000;
}

/// Direction a packet travelled relative to the flow's outbound side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    SynReceived,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Closed,
}

impl TcpState {
    pub fn idle_timeout(self) -> Duration {
        match self {
            TcpState::Established => ESTABLISHED_TIMEOUT,
            _ => CLOSING_TIMEOUT,
        }
    }

    pub fn is_established(self) -> bool {
        matches!(self, TcpState::Established)
    }
}

pub const ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const CLOSING_TIMEOUT: Duration = Duration::from_secs(30);

fn has(f: u8, bit: u8) -> bool {
    f & bit == bit
}

fn is_syn_fin(f: u8) -> bool {
    has(f, flags::SYN) && has(f, flags::FIN)
}

/// Pure transition function for one packet against an existing flow.
///
/// Returns `(new_state, accepted)`. `new_state` is `None` when the packet
/// doesn't change the flow's state (e.g. a SYN retransmission); `accepted`
/// tells the caller whether the packet should be admitted.
pub fn transition(state: TcpState, dir: Direction, f: u8) -> (Option<TcpState>, bool) {
    if is_syn_fin(f) {
        return (None, false);
    }

    if has(f, flags::RST) {
        // Accepted on any existing flow; marks it closed. We don't actively
        // block what follows -- the flow is just evicted sooner.
        return (Some(TcpState::Closed), true);
    }

    use Direction::*;
    use TcpState::*;

    match (state, dir) {
        (SynSent, Inbound) if has(f, flags::SYN) && has(f, flags::ACK) => {
            (Some(Established), true)
        }
        (SynSent, Inbound) if has(f, flags::SYN) => {
            // Simultaneous open.
            (Some(SynReceived), true)
        }
        (SynSent, Outbound) if has(f, flags::SYN) => {
            // Retransmission of the initial SYN.
            (None, true)
        }

        (SynReceived, Inbound) if has(f, flags::SYN) && has(f, flags::ACK) => {
            (Some(Established), true)
        }
        (SynReceived, Outbound) if has(f, flags::ACK) => (Some(Established), true),

        (Established, Outbound) if has(f, flags::FIN) => (Some(FinWait), true),
        (Established, Inbound) if has(f, flags::FIN) => (Some(CloseWait), true),
        (Established, _) => (None, true),

        (FinWait, Inbound) if has(f, flags::FIN) => (Some(TimeWait), true),
        (FinWait, Inbound) if has(f, flags::ACK) => (None, true),
        (FinWait, _) => (None, true),

        (CloseWait, Outbound) if has(f, flags::FIN) => (Some(LastAck), true),
        (CloseWait, _) => (None, true),

        (LastAck, Inbound) if has(f, flags::ACK) => (Some(Closed), true),
        (LastAck, _) => (None, true),

        (TimeWait, _) => (None, true),
        (Closed, _) => (None, true),

        _ => (None, true),
    }
}

/// Whether a packet with no matching flow may create one (strict
/// unsolicited-inbound policy, spec.md §4.2).
pub fn admits_unsolicited_inbound(f: u8) -> bool {
    has(f, flags::SYN) && !has(f, flags::ACK) && !has(f, flags::FIN) && !has(f, flags::RST)
}

#[derive(Debug, Clone, Copy)]
pub struct TcpFlow {
    pub state: TcpState,
}

impl TcpFlow {
    pub fn new(state: TcpState) -> Self {
        Self { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_flag_combos() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn unsolicited_inbound_rejects_everything_but_bare_syn() {
        for f in all_flag_combos() {
            let admitted = admits_unsolicited_inbound(f);
            let is_bare_syn = has(f, flags::SYN)
                && !has(f, flags::ACK)
                && !has(f, flags::FIN)
                && !has(f, flags::RST);
            assert_eq!(admitted, is_bare_syn, "flags = {f:#04b}");
        }
    }

    #[test]
    fn handshake_then_data() {
        // TrackOutbound(SYN)
        let (s, accepted) = transition(TcpState::SynSent, Direction::Outbound, flags::SYN);
        assert!(accepted);
        assert!(s.is_none());

        // IsValidInbound(SYN+ACK)
        let (s, accepted) = transition(
            TcpState::SynSent,
            Direction::Inbound,
            flags::SYN | flags::ACK,
        );
        assert!(accepted);
        assert_eq!(s, Some(TcpState::Established));

        // TrackOutbound(ACK)
        let (s, accepted) = transition(TcpState::Established, Direction::Outbound, flags::ACK);
        assert!(accepted);
        assert!(s.is_none());

        // IsValidInbound(PSH+ACK)
        let (_, accepted) = transition(
            TcpState::Established,
            Direction::Inbound,
            flags::PSH | flags::ACK,
        );
        assert!(accepted);
    }

    #[test]
    fn rst_on_established_closes() {
        let (s, accepted) = transition(TcpState::Established, Direction::Inbound, flags::RST);
        assert!(accepted);
        assert_eq!(s, Some(TcpState::Closed));
    }

    #[test]
    fn syn_fin_always_invalid() {
        let (s, accepted) = transition(
            TcpState::SynSent,
            Direction::Inbound,
            flags::SYN | flags::FIN,
        );
        assert!(!accepted);
        assert!(s.is_none());
    }

    #[test]
    fn simultaneous_close_is_idempotent_per_direction() {
        let (s, accepted) = transition(
            TcpState::Established,
            Direction::Outbound,
            flags::FIN | flags::ACK,
        );
        assert!(accepted);
        assert_eq!(s, Some(TcpState::FinWait));

        let (s, accepted) = transition(
            TcpState::Established,
            Direction::Inbound,
            flags::FIN | flags::ACK,
        );
        assert!(accepted);
        assert_eq!(s, Some(TcpState::CloseWait));
    }

    proptest! {
        #[test]
        fn rst_always_closes_an_existing_flow(
            state in prop_oneof![
                Just(TcpState::SynSent),
                Just(TcpState::SynReceived),
                Just(TcpState::Established),
                Just(TcpState::FinWait),
                Just(TcpState::CloseWait),
                Just(TcpState::LastAck),
            ],
            dir in prop_oneof![Just(Direction::Inbound), Just(Direction::Outbound)],
        ) {
            let (s, accepted) = transition(state, dir, flags::RST);
            prop_assert!(accepted);
            prop_assert_eq!(s, Some(TcpState::Closed));
        }

        #[test]
        fn second_syn_on_syn_sent_is_a_retransmission(_unused in 0u8..1) {
            let (s, accepted) = transition(TcpState::SynSent, Direction::Outbound, flags::SYN);
            prop_assert!(accepted);
            prop_assert_eq!(s, None);
        }
    }
}
