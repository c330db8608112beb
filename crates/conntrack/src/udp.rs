use std::time::Duration;

pub const UDP_TIMEOUT: Duration = Duration::from_secs(30);

/// UDP has no connection state beyond "has this 5-tuple been seen recently".
#[derive(Debug, Clone, Copy)]
pub struct UdpFlow;
