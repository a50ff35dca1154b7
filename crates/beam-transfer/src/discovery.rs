/// LAN discovery over UDP broadcast.
///
/// The sender shouts `SENDER_REQUEST:<filename>:<size>:<key>` at every /24
/// broadcast address twice a second for three seconds and collects
/// `RECEIVER_READY` replies on the discovery port. A receiver process runs
/// the responder loop for its whole lifetime next to the TCP listener.
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info};

use beam_protocol::discovery::{
    SenderRequest, DISCOVERY_PORT, RECEIVER_READY, SENDER_REQUEST_PREFIX,
};

use crate::error::TransferError;

pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(500);

/// Broadcast the request and return the address of the first receiver that
/// answers, preferring responders that are not this host.
pub async fn find_receiver(request: &SenderRequest) -> Result<IpAddr, TransferError> {
    let responses = bind_discovery_port()?;
    let broadcast = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    broadcast.set_broadcast(true)?;

    let line = request.to_line();
    let targets = broadcast_addresses();
    let own_ip = local_ipv4().map(IpAddr::V4);
    debug!(?targets, "broadcasting discovery request");

    let deadline = time::Instant::now() + DISCOVERY_WINDOW;
    let mut ticker = time::interval(BROADCAST_INTERVAL);
    let mut buf = [0u8; 1024];
    let mut responders: Vec<IpAddr> = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for addr in &targets {
                    let _ = broadcast.send_to(line.as_bytes(), (*addr, DISCOVERY_PORT)).await;
                }
            }
            recv = responses.recv_from(&mut buf) => {
                if let Ok((n, src)) = recv {
                    let msg = String::from_utf8_lossy(&buf[..n]);
                    if msg.trim() == RECEIVER_READY && !responders.contains(&src.ip()) {
                        debug!(from = %src, "receiver responded");
                        responders.push(src.ip());
                    }
                }
            }
            _ = time::sleep_until(deadline) => break,
        }
    }

    responders
        .iter()
        .find(|ip| !ip.is_loopback() && Some(**ip) != own_ip)
        .or_else(|| responders.first())
        .copied()
        .ok_or(TransferError::NoReceiverFound)
}

/// Answer discovery requests forever. Run alongside the TCP listener.
pub async fn respond_to_discovery() -> io::Result<()> {
    let sock = bind_discovery_port()?;
    info!(port = DISCOVERY_PORT, "discovery responder up");
    let mut buf = [0u8; 1024];
    loop {
        let (n, src) = sock.recv_from(&mut buf).await?;
        if buf[..n].starts_with(SENDER_REQUEST_PREFIX.as_bytes()) {
            debug!(from = %src, "discovery request");
            let _ = sock
                .send_to(RECEIVER_READY.as_bytes(), (src.ip(), DISCOVERY_PORT))
                .await;
        }
    }
}

/// Bind the fixed discovery port with SO_REUSEADDR so sender and receiver
/// roles can coexist on one machine.
fn bind_discovery_port() -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT));
    sock.bind(&addr.into())?;
    UdpSocket::from_std(sock.into())
}

/// The IPv4 the OS would route toward the wider network. No packets are
/// actually sent by the lookup.
fn local_ipv4() -> Option<Ipv4Addr> {
    let sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    sock.connect(("8.8.8.8", 80)).ok()?;
    match sock.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// The /24 broadcast address of the primary interface, with the all-ones
/// address as fallback.
fn broadcast_addresses() -> Vec<Ipv4Addr> {
    match local_ipv4() {
        Some(ip) if !ip.is_loopback() => {
            let [a, b, c, _] = ip.octets();
            vec![Ipv4Addr::new(a, b, c, 255)]
        }
        _ => vec![Ipv4Addr::BROADCAST],
    }
}
