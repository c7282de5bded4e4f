use crate::config::{MonitorConfig, ProbeKind};
use crate::core::error::ProbeError;
use async_trait::async_trait;
use futures::future::select_ok;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Reachability check against a device address.
///
/// Returns the measured round trip on success. Any error means the device
/// is treated as unreachable.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str) -> Result<Duration, ProbeError>;
}

pub fn build_prober(config: &MonitorConfig) -> Result<Arc<dyn Prober>, ProbeError> {
    match config.probe {
        ProbeKind::Tcp => Ok(Arc::new(
            TcpProber::new(config.ports.clone(), config.probe_timeout())
                .refused_is_reachable(config.refused_is_reachable),
        )),
        ProbeKind::Icmp => Ok(Arc::new(IcmpProber::new(config.probe_timeout())?)),
    }
}

/// Connects to a list of well-known ports, first answer wins.
#[derive(Debug, Clone)]
pub struct TcpProber {
    ports: Vec<u16>,
    timeout: Duration,
    refused_is_reachable: bool,
}

impl TcpProber {
    pub fn new(ports: Vec<u16>, timeout: Duration) -> TcpProber {
        TcpProber {
            ports,
            timeout,
            refused_is_reachable: true,
        }
    }

    /// A refused connection still proves the host is up.
    pub fn refused_is_reachable(mut self, refused_is_reachable: bool) -> TcpProber {
        self.refused_is_reachable = refused_is_reachable;
        self
    }

    fn targets(&self, address: &str) -> Vec<String> {
        if address.parse::<SocketAddr>().is_ok() || has_explicit_port(address) {
            return vec![address.to_string()];
        }
        let host = if address.parse::<Ipv6Addr>().is_ok() {
            format!("[{address}]")
        } else {
            address.to_string()
        };
        self.ports
            .iter()
            .map(|port| format!("{host}:{port}"))
            .collect()
    }
}

// "host:port" where host is a name or IPv4 address
fn has_explicit_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl TcpProber {
    async fn connect(&self, target: String) -> Result<Duration, ProbeError> {
        let start_time = Instant::now();
        match TcpStream::connect(&target).await {
            Ok(_stream) => Ok(start_time.elapsed()),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused && self.refused_is_reachable => {
                debug!(target = %target, "connection refused, host answered");
                Ok(start_time.elapsed())
            }
            Err(e) => Err(ProbeError::Unreachable(format!("{target}: {e}"))),
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    /// Connects to every port at once under one shared timeout.
    async fn probe(&self, address: &str) -> Result<Duration, ProbeError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ProbeError::EmptyAddress);
        }
        let targets = self.targets(address);
        if targets.is_empty() {
            return Err(ProbeError::Unreachable(format!("{address}: no ports configured")));
        }
        let attempts = targets.into_iter().map(|target| Box::pin(self.connect(target)));
        match tokio::time::timeout(self.timeout, select_ok(attempts)).await {
            Ok(Ok((latency, _pending))) => Ok(latency),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

/// ICMP echo. Needs raw socket privileges (or unprivileged ping sockets).
pub struct IcmpProber {
    client_v4: Client,
    client_v6: Option<Client>,
    timeout: Duration,
}

impl IcmpProber {
    pub fn new(timeout: Duration) -> Result<IcmpProber, ProbeError> {
        let client_v4 = Client::new(&Config::default())
            .map_err(|e| ProbeError::Unavailable(format!("icmp socket: {e}")))?;
        let client_v6 = match Client::new(&Config::builder().kind(ICMP::V6).build()) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "ipv6 icmp socket unavailable, ipv6 devices will be reported offline");
                None
            }
        };
        Ok(IcmpProber {
            client_v4,
            client_v6,
            timeout,
        })
    }

    async fn resolve(address: &str) -> Result<IpAddr, ProbeError> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(ip);
        }
        let mut addrs = tokio::net::lookup_host((address, 0))
            .await
            .map_err(|e| ProbeError::Resolve(format!("{address}: {e}")))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| ProbeError::Resolve(address.to_string()))
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, address: &str) -> Result<Duration, ProbeError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ProbeError::EmptyAddress);
        }
        let ip = IcmpProber::resolve(address).await?;
        let client = match ip {
            IpAddr::V4(_) => &self.client_v4,
            IpAddr::V6(_) => self
                .client_v6
                .as_ref()
                .ok_or_else(|| ProbeError::Unavailable("ipv6 icmp socket".to_string()))?,
        };
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(self.timeout);
        match pinger.ping(PingSequence(0), &[0; 16]).await {
            Ok((_reply, rtt)) => Ok(rtt),
            Err(surge_ping::SurgeError::Timeout { .. }) => Err(ProbeError::Timeout(self.timeout)),
            Err(e) => Err(ProbeError::Unreachable(format!("{ip}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpSocket};

    /// Listener with backlog 1 whose accept queue is full, so new connects
    /// hang like a port behind a dropping firewall.
    async fn saturated_listener() -> (TcpListener, Vec<TcpStream>) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut held = Vec::new();
        for _ in 0..16 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                Ok(Err(e)) => panic!("connect failed: {e}"),
                Err(_) => return (listener, held),
            }
        }
        panic!("accept queue never filled");
    }

    #[test]
    fn expands_bare_addresses_over_ports() {
        let prober = TcpProber::new(vec![80, 443], Duration::from_secs(1));
        assert_eq!(
            prober.targets("192.168.1.1"),
            vec!["192.168.1.1:80".to_string(), "192.168.1.1:443".to_string()]
        );
        assert_eq!(prober.targets("::1"), vec!["[::1]:80".to_string(), "[::1]:443".to_string()]);
        assert_eq!(prober.targets("server01.local:8080"), vec!["server01.local:8080".to_string()]);
        assert_eq!(prober.targets("[::1]:22"), vec!["[::1]:22".to_string()]);
    }

    #[tokio::test]
    async fn connects_to_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let prober = TcpProber::new(vec![addr.port()], Duration::from_secs(1));

        let latency = prober.probe("127.0.0.1").await.unwrap();
        assert!(latency < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn refused_port_counts_only_when_allowed() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let strict = TcpProber::new(vec![port], Duration::from_secs(1)).refused_is_reachable(false);
        assert!(matches!(
            strict.probe("127.0.0.1").await,
            Err(ProbeError::Unreachable(_))
        ));

        let lenient = TcpProber::new(vec![port], Duration::from_secs(1));
        assert!(lenient.probe("127.0.0.1").await.is_ok());
    }

    #[tokio::test]
    async fn blank_address_is_rejected() {
        let prober = TcpProber::new(vec![80], Duration::from_secs(1));
        assert!(matches!(prober.probe("  ").await, Err(ProbeError::EmptyAddress)));
    }

    #[tokio::test]
    async fn hanging_port_does_not_hide_an_open_one() {
        let (filtered, _held) = saturated_listener().await;
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let prober = TcpProber::new(
            vec![
                filtered.local_addr().unwrap().port(),
                open.local_addr().unwrap().port(),
            ],
            Duration::from_millis(500),
        );

        let latency = prober.probe("127.0.0.1").await.unwrap();
        assert!(latency < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn all_ports_hanging_times_out_once() {
        let (filtered, _held) = saturated_listener().await;
        let port = filtered.local_addr().unwrap().port();
        let prober = TcpProber::new(vec![port, port], Duration::from_millis(300));

        let started = Instant::now();
        assert!(matches!(prober.probe("127.0.0.1").await, Err(ProbeError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(600));
    }
}
