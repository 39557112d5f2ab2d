//! Linux socket options used for transparent proxying.
//!
//! Options go through `socket2`. Receiving the original destination of a
//! TPROXY datagram needs `IP_RECVORIGDSTADDR`, which `socket2` does not
//! expose, so that one option and the control message parsing live here.
//! Other platforms get `Unsupported` errors so configurations using these
//! features fail at startup instead of misbehaving.
#[cfg(not(target_os = "linux"))]
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

#[cfg(not(target_os = "linux"))]
use tokio::net::{TcpStream, UdpSocket};

/// Datagram plus where it came from and where it was headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedDatagram {
    pub len: usize,
    pub peer: SocketAddr,
    /// `None` when the kernel attached no original destination
    pub original_dst: Option<SocketAddr>,
}

#[cfg(target_os = "linux")]
mod imp {
    use std::{
        io,
        mem::{MaybeUninit, size_of},
        net::{Ipv6Addr, SocketAddr},
        os::fd::{AsFd, AsRawFd},
    };

    use socket2::{Domain, MaybeUninitSlice, MsgHdrMut, SockAddr, SockRef, Socket, Type};
    use tokio::{
        io::Interest,
        net::{TcpStream, UdpSocket},
    };

    use super::{ReceivedDatagram, parse_original_dst};

    /// Room for one `IP_ORIGDSTADDR`/`IPV6_ORIGDSTADDR` message
    const CONTROL_LEN: usize = 128;

    pub fn set_mark<S: AsFd>(socket: &S, mark: u32) -> io::Result<()> {
        SockRef::from(socket).set_mark(mark)
    }

    pub fn set_transparent<S: AsFd>(socket: &S, ipv6: bool) -> io::Result<()> {
        let socket = SockRef::from(socket);
        if ipv6 {
            socket.set_ip_transparent_v6(true)
        } else {
            socket.set_ip_transparent_v4(true)
        }
    }

    pub fn original_dst_of(stream: &TcpStream) -> io::Result<SocketAddr> {
        let socket = SockRef::from(stream);
        let addr = if stream.local_addr()?.is_ipv6() {
            socket.original_dst_v6()?
        } else {
            socket.original_dst_v4()?
        };
        addr.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "original destination is not an IP address")
        })
    }

    /// Ask the kernel to attach the original destination to every datagram.
    pub fn recv_original_dst<S: AsFd>(socket: &S, ipv6: bool) -> io::Result<()> {
        let (level, name) = if ipv6 {
            (libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR)
        } else {
            (libc::SOL_IP, libc::IP_RECVORIGDSTADDR)
        };
        let enable: libc::c_int = 1;
        // SAFETY: `enable` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_fd().as_raw_fd(),
                level,
                name,
                (&enable as *const libc::c_int).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// UDP socket bound to `addr`, which need not be local.
    pub fn bind_transparent_udp(addr: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_reuse_address(reuse)?;
        set_transparent(&socket, addr.is_ipv6())?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
        // SAFETY: the kernel only stores initialised bytes through this view.
        unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
    }

    fn recvmsg(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<ReceivedDatagram> {
        let socket = SockRef::from(socket);
        let mut control = [0u8; CONTROL_LEN];
        // large enough for either family; the kernel fills in the right one
        let mut peer = SockAddr::from(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)));

        let (len, control_len) = {
            let mut bufs = [MaybeUninitSlice::new(as_uninit(buf))];
            let mut msg = MsgHdrMut::new()
                .with_addr(&mut peer)
                .with_buffers(&mut bufs)
                .with_control(as_uninit(&mut control));
            let len = socket.recvmsg(&mut msg, 0)?;
            (len, msg.control_len())
        };

        let peer = peer.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "datagram from a non-IP peer")
        })?;
        Ok(ReceivedDatagram {
            len,
            peer,
            original_dst: parse_original_dst(&control[..control_len.min(CONTROL_LEN)]),
        })
    }

    pub async fn recv_with_original_dst(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<ReceivedDatagram> {
        socket
            .async_io(Interest::READABLE, || recvmsg(socket, buf))
            .await
    }
}

#[cfg(target_os = "linux")]
pub use imp::{
    bind_transparent_udp, original_dst_of, recv_original_dst, recv_with_original_dst, set_mark,
    set_transparent,
};

#[cfg(not(target_os = "linux"))]
fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is only available on Linux"),
    )
}

#[cfg(not(target_os = "linux"))]
pub fn set_mark<S>(_socket: &S, _mark: u32) -> io::Result<()> {
    Err(unsupported("SO_MARK"))
}

#[cfg(not(target_os = "linux"))]
pub fn set_transparent<S>(_socket: &S, _ipv6: bool) -> io::Result<()> {
    Err(unsupported("IP_TRANSPARENT"))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst_of(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(unsupported("SO_ORIGINAL_DST"))
}

#[cfg(not(target_os = "linux"))]
pub fn recv_original_dst<S>(_socket: &S, _ipv6: bool) -> io::Result<()> {
    Err(unsupported("IP_RECVORIGDSTADDR"))
}

#[cfg(not(target_os = "linux"))]
pub fn bind_transparent_udp(_addr: SocketAddr, _reuse: bool) -> io::Result<UdpSocket> {
    Err(unsupported("IP_TRANSPARENT"))
}

#[cfg(not(target_os = "linux"))]
pub async fn recv_with_original_dst(
    _socket: &UdpSocket,
    _buf: &mut [u8],
) -> io::Result<ReceivedDatagram> {
    Err(unsupported("IP_RECVORIGDSTADDR"))
}

// linux/in.h and linux/in6.h; libc only defines these for Linux targets
const SOL_IP: i32 = 0;
const SOL_IPV6: i32 = 41;
const IP_ORIGDSTADDR: i32 = 20;
const IPV6_ORIGDSTADDR: i32 = 74;

/// Find the original destination among the control messages of a datagram.
///
/// The buffer holds `cmsghdr` records: a native-endian `size_t` length, the
/// level and type as `int`, then the payload, each record padded to the
/// alignment of `size_t`.
fn parse_original_dst(control: &[u8]) -> Option<SocketAddr> {
    const WORD: usize = size_of::<usize>();
    let align = |len: usize| len.div_ceil(WORD) * WORD;
    let header = align(WORD + 8);

    let mut offset = 0;
    while offset + header <= control.len() {
        let record = &control[offset..];
        let len = usize::from_ne_bytes(record[..WORD].try_into().ok()?);
        let level = i32::from_ne_bytes(record[WORD..WORD + 4].try_into().ok()?);
        let kind = i32::from_ne_bytes(record[WORD + 4..WORD + 8].try_into().ok()?);
        if len < header || len > record.len() {
            return None;
        }

        let data = &record[header..len];
        match (level, kind) {
            (SOL_IP, IP_ORIGDSTADDR) => return sockaddr_in(data),
            (SOL_IPV6, IPV6_ORIGDSTADDR) => return sockaddr_in6(data),
            _ => offset += align(len),
        }
    }
    None
}

fn sockaddr_in(data: &[u8]) -> Option<SocketAddr> {
    let bytes: &[u8; 8] = data.get(..8)?.try_into().ok()?;
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
    Some(SocketAddr::from((ip, port)))
}

fn sockaddr_in6(data: &[u8]) -> Option<SocketAddr> {
    let data = data.get(..28)?;
    let port = u16::from_be_bytes([data[2], data[3]]);
    let flowinfo = u32::from_ne_bytes(data[4..8].try_into().ok()?);
    let ip: [u8; 16] = data[8..24].try_into().ok()?;
    let scope_id = u32::from_ne_bytes(data[24..28].try_into().ok()?);
    Some(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(ip),
        port,
        flowinfo,
        scope_id,
    )))
}
