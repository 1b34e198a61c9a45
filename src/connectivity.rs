use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const DEFAULT_PROBE_ADDR: &str = "8.8.8.8:53";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Answers whether the sink is currently worth trying.
///
/// Implementations must be side-effect free and safe to call from many
/// intake threads at once. Any probe error counts as unreachable.
pub trait ConnectivityProbe: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// Probes reachability with a TCP connect to a well-known address.
#[derive(Clone, Debug)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        Ok(self.addr.to_socket_addrs()?.collect())
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_ADDR, DEFAULT_PROBE_TIMEOUT)
    }
}

impl ConnectivityProbe for TcpProbe {
    fn is_reachable(&self) -> bool {
        let addrs = match self.resolve() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::debug!("probe {} unresolvable: {}", self.addr, e);
                return false;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return true,
                Err(e) => log::debug!("probe {} failed: {}", addr, e),
            }
        }
        false
    }
}

/// Probe with a fixed answer, for deployments where the sink is local.
#[derive(Clone, Copy, Debug)]
pub struct AlwaysReachable;

impl ConnectivityProbe for AlwaysReachable {
    fn is_reachable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn reachable_when_listener_accepts() -> std::io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let probe = TcpProbe::new(listener.local_addr()?.to_string(), Duration::from_millis(500));
        assert!(probe.is_reachable());
        Ok(())
    }

    #[test]
    fn unreachable_when_nothing_listens() -> std::io::Result<()> {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?
        };
        let probe = TcpProbe::new(addr.to_string(), Duration::from_millis(500));
        assert!(!probe.is_reachable());
        Ok(())
    }

    #[test]
    fn unresolvable_address_is_unreachable() {
        let probe = TcpProbe::new("not a socket address", Duration::from_millis(100));
        assert!(!probe.is_reachable());
    }
}
