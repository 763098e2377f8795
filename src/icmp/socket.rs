use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

const RECV_BUFFER_LEN: usize = 65536;
/// Finest read timeout the socket honours. Shorter non-zero values would be
/// truncated to zero, which SO_RCVTIMEO treats as "wait forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_micros(1);

/// A datagram endpoint able to carry ICMP messages.
pub trait Transport: Send {
    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<()>;

    /// Waits at most `wait` for the next ICMP message. `Ok(None)` means the
    /// wait expired without one.
    fn recv(
        &mut self,
        wait: Duration,
    ) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;
}

/// Raw IPv4 ICMP socket.
pub struct IcmpSocket {
    socket: Socket,
}

impl IcmpSocket {
    pub fn open() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to create raw socket: {}. Elevated privileges may be required.", e),
            )
        })?;

        socket.set_nonblocking(false)?;

        Ok(Self { socket })
    }
}

impl Transport for IcmpSocket {
    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<()> {
        let target_addr = SocketAddrV4::new(target, 0);

        log::debug!("Sending ICMP packet to {}: {} bytes", target, packet.len());
        self.socket.send_to(packet, &target_addr.into())?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> io::Result<Option<Vec<u8>>> {
        let Some(wait) = read_timeout(wait) else {
            return Ok(None);
        };

        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(wait))?;

        let received = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; RECV_BUFFER_LEN];
            let n = (&socket).read(&mut buffer)?;
            buffer.truncate(n);
            Ok::<_, io::Error>(buffer)
        })
        .await
        .map_err(io::Error::other)?;

        match received {
            Ok(datagram) => {
                log::debug!("Received {} bytes", datagram.len());
                // A truncated datagram surfaces as an empty message and fails decoding
                let icmp = strip_ipv4_header(&datagram).unwrap_or_default();
                Ok(Some(icmp.to_vec()))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// The read timeout for a wait budget, or `None` when the budget is already
/// spent.
fn read_timeout(wait: Duration) -> Option<Duration> {
    (wait >= MIN_READ_TIMEOUT).then_some(wait)
}

/// Raw IPv4 sockets deliver the IP header in front of the ICMP message.
fn strip_ipv4_header(datagram: &[u8]) -> Option<&[u8]> {
    let first = *datagram.first()?;
    if first >> 4 != 4 {
        return Some(datagram);
    }
    let header_len = ((first & 0x0F) as usize) * 4;
    datagram.get(header_len..)
}
