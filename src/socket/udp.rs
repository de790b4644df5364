use core::time::Duration;
use std::io;
use std::net::{SocketAddr, IpAddr, Ipv4Addr};
use log::trace;
use super::{EthercatSocket, ETHERCAT_PROTOCOL};

/**
    UDP socket with fixed port, allowing ethercat com through a regular switch
*/
pub struct UdpSocket {
    socket: std::net::UdpSocket,
    address: SocketAddr,

    filter_address: bool,
}

impl UdpSocket {
    /// according to ETG.1000.4 only IPv4 is supported, and port is fixed, hence this function only requires the host address
    pub fn new(segment: Ipv4Addr) -> io::Result<Self> {
        let address = SocketAddr::new(IpAddr::V4(segment), ETHERCAT_PROTOCOL);
        let socket = std::net::UdpSocket::bind(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                ETHERCAT_PROTOCOL,
                ))?;
        Ok(Self {
            address,
            socket,
            filter_address: true,
        })
    }
    /// when enabled, datagrams from other hosts than the segment are ignored
    pub fn set_filter_address(&mut self, enable: bool) {
        self.filter_address = enable;
    }
}

impl EthercatSocket for UdpSocket {
    fn receive(&mut self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        // a zero timeout means blocking forever for std sockets
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_micros(1))))?;
        loop {
            match self.socket.recv_from(data) {
                Ok((size, source)) => {
                    // ignore wrong hosts
                    if self.filter_address && source != self.address {
                        trace!("ignored datagram from {}", source);
                        continue
                    }
                    return Ok(Some(size))
                },
                Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
                    => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.address)?;
        Ok(())
    }
    fn max_frame(&self) -> usize {
        // ipv4 payload in a standard ethernet frame, minus ip and udp headers
        1500 - 20 - 8
    }
}
