use core::time::Duration;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use packed_struct::prelude::*;
use log::trace;
use super::{EthercatSocket, ETHERCAT_PROTOCOL};


/// mac address used as source by this master, the first slave sets the locally administered bit on returning frames
const MASTER_ADDRESS: [u8; 6] = [0x10, 0x10, 0x10, 0x10, 0x10, 0x10];
/// broadcast destination, every slave forwards the frame
const SEGMENT_ADDRESS: [u8; 6] = [0xff; 6];
/// minimum ethernet payload, shorter frames are padded
const MIN_FRAME: usize = 60;
const MAX_ETHERNET_FRAME: usize = 1514;
const HEADER_LEN: usize = 14;

/**
    Raw socket allowing direct ethercat com, but only one segment on the ethernet network

    Raw sockets are not implemented in std::net, so here is an implementation using `AF_PACKET` sockets.
    This implementation is linux-specific
*/
#[derive(Debug)]
pub struct EthernetSocket {
    lower: libc::c_int,
    buffer: Vec<u8>,
}

impl EthernetSocket {
    pub fn new(interface: &str) -> io::Result<Self> {
        let protocol = ETHERCAT_PROTOCOL;

        // create
        let lower = unsafe {
            let lower = libc::socket(
                // Ethernet II frames
                libc::AF_PACKET,
                libc::SOCK_RAW,
                protocol.to_be() as i32,
            );
            if lower == -1 {
                return Err(io::Error::last_os_error());
            }
            lower
        };
        let new = EthernetSocket {
            lower,
            buffer: vec![0; MAX_ETHERNET_FRAME],
        };

        // bind
        let mut ifreq = ifreq_for(interface)?;
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: protocol.to_be(),
            sll_ifindex: ifreq_ioctl(new.lower, &mut ifreq, libc::SIOCGIFINDEX)?,
            sll_hatype: 1,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };
        let res = unsafe {
            libc::bind(
                new.lower,
                &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(new)
    }

    /// wait for the socket to be readable, return false on timeout
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut fd = libc::pollfd {
            fd: self.lower,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        let res = unsafe { libc::poll(&mut fd, 1, millis) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res > 0)
    }
}

impl Drop for EthernetSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.lower);
        }
    }
}

impl AsRawFd for EthernetSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.lower
    }
}

impl EthercatSocket for EthernetSocket {
    fn receive(&mut self, data: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let header_len = HEADER_LEN;
        loop {
            if ! self.wait(timeout)?  {return Ok(None)}
            let len = unsafe {
                libc::read(
                    self.lower,
                    self.buffer.as_mut_ptr() as *mut libc::c_void,
                    self.buffer.len(),
                )
            };
            if len < 0 {
                return Err(io::Error::last_os_error());
            }
            let len = len as usize;
            if len < header_len  {continue}
            let header = EthernetHeader::unpack_from_slice(&self.buffer[.. header_len])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed ethernet header"))?;
            // non-ethercat trafic and the kernel's echo of our own frames are ignored
            if header.ty != ETHERCAT_PROTOCOL || header.src == MASTER_ADDRESS {
                trace!("ignored ethernet frame of type {:x}", header.ty);
                continue
            }
            let content = &self.buffer[header_len .. len];
            let size = content.len().min(data.len());
            data[.. size].copy_from_slice(&content[.. size]);
            return Ok(Some(size))
        }
    }
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut packed = heapless::Vec::<u8, MAX_ETHERNET_FRAME>::new();
        let padding = [0; MIN_FRAME];
        let header = EthernetHeader {
            dst: SEGMENT_ADDRESS,
            src: MASTER_ADDRESS,
            // vlan is said to be optional and this is not present in most ethercat frames, so will not be used here
            ty: ETHERCAT_PROTOCOL,
            }.pack()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "cannot pack ethernet header"))?;
        let overflow = || io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds ethernet capacity");
        packed.extend_from_slice(&header).map_err(|_| overflow())?;
        packed.extend_from_slice(data).map_err(|_| overflow())?;
        if packed.len() < padding.len() {
            let missing = padding.len() - packed.len();
            packed.extend_from_slice(&padding[.. missing]).map_err(|_| overflow())?;
        }

        let len = unsafe {
            libc::write(
                self.lower,
                packed.as_ptr() as *const libc::c_void,
                packed.len(),
            )
        };
        if len < 0 || (len as usize) != packed.len() {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
    fn max_frame(&self) -> usize {
        MAX_ETHERNET_FRAME - HEADER_LEN
    }
}


// intermediate C-like structures and functions

#[repr(C)]
#[derive(Debug)]
struct ifreq {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_data: libc::c_int, /* ifr_ifindex or ifr_mtu */
}

fn ifreq_ioctl(
    lower: libc::c_int,
    ifreq: &mut ifreq,
    cmd: libc::c_ulong,
) -> io::Result<libc::c_int> {
    let res = unsafe { libc::ioctl(lower, cmd, ifreq as *mut ifreq) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ifreq.ifr_data)
}

fn ifreq_for(name: &str) -> io::Result<ifreq> {
    let mut ifreq = ifreq {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_data: 0,
    };
    if name.len() >= libc::IF_NAMESIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    for (i, byte) in name.as_bytes().iter().enumerate() {
        ifreq.ifr_name[i] = *byte as libc::c_char
    }
    Ok(ifreq)
}


#[derive(PackedStruct, Clone, Debug)]
#[packed_struct(size_bytes="14", bit_numbering = "lsb0", endian = "msb")]
struct EthernetHeader {
    #[packed_field(bytes="8:13")]  dst: [u8;6],
    #[packed_field(bytes="2:7")]  src: [u8;6],
    #[packed_field(bytes="0:1")]  ty: u16,
}
