// ptpsyncd — UDP Transport
// Distributed under the MIT software license.

//! Event/general sockets with kernel timestamping.
//!
//! Two bound sockets per port (event 319, general 320) plus one unbound
//! monitoring socket. The event socket carries kernel timestamping with a
//! four-level fallback: hardware SO_TIMESTAMPING, software SO_TIMESTAMPING,
//! SCM_TIMESTAMPNS, SCM_TIMESTAMP. TX timestamps come back on the error
//! queue attached to a loopback of the sent PDU.

use crate::config::{Config, Ipv6Scope, TransportMode};
use crate::error::TransportError;
use crate::types::{
    Timestamp, PACKET_SIZE, PTP_EVENT_PORT, PTP_GENERAL_PORT, PTP_PEER_MULTICAST_V4,
    PTP_PEER_MULTICAST_V6, PTP_PRIMARY_MULTICAST_V4, PTP_PRIMARY_MULTICAST_V6_GLOBAL,
    PTP_PRIMARY_MULTICAST_V6_LINKLOCAL,
};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, info, warn};

// SO_TIMESTAMPING flag bits (linux/net_tstamp.h).
const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;

const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;

/// IPv6 sends append two zero bytes (1588 Annex E.1, UDP checksum aid) not
/// counted in messageLength.
pub const IPV6_TRAILER_LEN: usize = 2;

/// Bounded retry on EINTR/EAGAIN so no path can spin.
const SEND_RETRIES: usize = 3;

/// Achieved timestamping level, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampingMode {
    Hardware,
    Software,
    LegacyNs,
    Legacy,
}

/// A received datagram with its wire timestamp.
#[derive(Debug)]
pub struct RxPacket {
    pub data: Vec<u8>,
    pub from: SocketAddr,
    pub timestamp: Option<Timestamp>,
}

/// A resolved transmit timestamp: the looped-back PDU plus the egress time.
#[derive(Debug)]
pub struct TxTimestamp {
    pub payload: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Which flow a send belongs to; selects socket, group and TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Event,
    General,
    PeerEvent,
    PeerGeneral,
    /// Monitoring reply from the unbound socket; always unicast.
    Monitor,
}

pub struct PortSockets {
    event: AsyncFd<Socket>,
    general: AsyncFd<Socket>,
    monitor: Socket,
    transport: TransportMode,
    scope: Ipv6Scope,
    ifindex: u32,
    ttl: u32,
    ts_mode: TimestampingMode,
}

impl PortSockets {
    pub fn open(config: &Config) -> Result<Self, TransportError> {
        let ifindex = interface_index(&config.interface)?;

        let event = bind_socket(config, ifindex, PTP_EVENT_PORT)?;
        let ts_mode = enable_timestamping(&event)?;
        info!(
            "event socket timestamping mode: {:?} (interface {})",
            ts_mode, config.interface
        );
        let general = bind_socket(config, ifindex, PTP_GENERAL_PORT)?;

        let domain = match config.transport {
            TransportMode::Ipv4 => Domain::IPV4,
            TransportMode::Ipv6 => Domain::IPV6,
        };
        let monitor =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(TransportError::Setup)?;
        monitor.set_nonblocking(true).map_err(TransportError::Setup)?;

        Ok(PortSockets {
            event: AsyncFd::with_interest(event, Interest::READABLE | Interest::ERROR)
                .map_err(TransportError::Setup)?,
            general: AsyncFd::with_interest(general, Interest::READABLE)
                .map_err(TransportError::Setup)?,
            monitor,
            transport: config.transport,
            scope: config.ipv6_scope,
            ifindex,
            ttl: config.ttl,
            ts_mode,
        })
    }

    pub fn timestamping(&self) -> TimestampingMode {
        self.ts_mode
    }

    /// Trailer appended to every sent PDU for this transport family.
    pub fn trailer_len(&self) -> usize {
        match self.transport {
            TransportMode::Ipv4 => 0,
            TransportMode::Ipv6 => IPV6_TRAILER_LEN,
        }
    }

    fn multicast_destination(&self, kind: SendKind) -> SocketAddr {
        let port = match kind {
            SendKind::Event | SendKind::PeerEvent => PTP_EVENT_PORT,
            _ => PTP_GENERAL_PORT,
        };
        match self.transport {
            TransportMode::Ipv4 => {
                let group = match kind {
                    SendKind::PeerEvent | SendKind::PeerGeneral => PTP_PEER_MULTICAST_V4,
                    _ => PTP_PRIMARY_MULTICAST_V4,
                };
                SocketAddr::V4(SocketAddrV4::new(group, port))
            }
            TransportMode::Ipv6 => {
                let group: Ipv6Addr = match kind {
                    SendKind::PeerEvent | SendKind::PeerGeneral => PTP_PEER_MULTICAST_V6,
                    _ => match self.scope {
                        Ipv6Scope::LinkLocal => PTP_PRIMARY_MULTICAST_V6_LINKLOCAL,
                        Ipv6Scope::Global => PTP_PRIMARY_MULTICAST_V6_GLOBAL,
                    },
                };
                SocketAddr::V6(SocketAddrV6::new(group, port, 0, self.ifindex))
            }
        }
    }

    /// Send a packed message. `dest = None` selects the multicast group for
    /// `kind`. Returns the trailer length appended, for TX-cache bookkeeping.
    pub async fn send(
        &self,
        kind: SendKind,
        message: &[u8],
        dest: Option<SocketAddr>,
    ) -> Result<usize, TransportError> {
        let mut pdu = message.to_vec();
        if self.transport == TransportMode::Ipv6 {
            pdu.extend_from_slice(&[0u8; IPV6_TRAILER_LEN]);
        }

        if kind == SendKind::Monitor {
            let Some(dest) = dest else {
                return Err(TransportError::Send(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "monitoring send needs a destination",
                )));
            };
            self.send_monitor(&pdu, dest)?;
            return Ok(self.trailer_len());
        }

        let dest = dest.unwrap_or_else(|| self.multicast_destination(kind));
        let socket = match kind {
            SendKind::Event | SendKind::PeerEvent => &self.event,
            _ => &self.general,
        };

        // Peer-delay multicast always goes out with TTL 1.
        let peer = matches!(kind, SendKind::PeerEvent | SendKind::PeerGeneral);
        if peer {
            self.set_ttl(socket.get_ref(), 1)?;
        }
        let result = self.send_on(socket, &pdu, dest).await;
        if peer {
            self.set_ttl(socket.get_ref(), self.ttl)?;
        }
        result?;
        Ok(self.trailer_len())
    }

    /// Send a monitoring datagram from the unbound socket.
    pub fn send_monitor(&self, message: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        self.monitor
            .send_to(message, &dest.into())
            .map(|_| ())
            .map_err(TransportError::Send)
    }

    async fn send_on(
        &self,
        socket: &AsyncFd<Socket>,
        pdu: &[u8],
        dest: SocketAddr,
    ) -> Result<(), TransportError> {
        for _ in 0..SEND_RETRIES {
            match socket.get_ref().send_to(pdu, &dest.into()) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let mut guard =
                        socket.writable().await.map_err(TransportError::Send)?;
                    guard.clear_ready();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Send(e)),
            }
        }
        Err(TransportError::Send(io::Error::new(io::ErrorKind::WouldBlock, "send retries exhausted")))
    }

    fn set_ttl(&self, socket: &Socket, ttl: u32) -> Result<(), TransportError> {
        match self.transport {
            TransportMode::Ipv4 => socket.set_multicast_ttl_v4(ttl),
            TransportMode::Ipv6 => socket.set_multicast_hops_v6(ttl),
        }
        .map_err(TransportError::Send)
    }

    /// Await and read one datagram from the event socket.
    pub async fn recv_event(&self) -> Result<RxPacket, TransportError> {
        recv_packet(&self.event).await
    }

    /// Await and read one datagram from the general socket.
    pub async fn recv_general(&self) -> Result<RxPacket, TransportError> {
        recv_packet(&self.general).await
    }

    /// Await one TX timestamp from the event socket's error queue.
    pub async fn recv_tx_timestamp(&self) -> Result<TxTimestamp, TransportError> {
        loop {
            let mut guard = self
                .event
                .ready(Interest::ERROR)
                .await
                .map_err(TransportError::Recv)?;
            match read_error_queue(self.event.get_ref()) {
                Ok(Some(ts)) => return Ok(ts),
                Ok(None) => {
                    guard.clear_ready();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                }
                Err(e) => return Err(TransportError::Recv(e)),
            }
        }
    }
}

fn interface_index(name: &str) -> Result<u32, TransportError> {
    let cname = CString::new(name).map_err(|_| {
        TransportError::Setup(io::Error::new(io::ErrorKind::InvalidInput, "bad interface name"))
    })?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(TransportError::Setup(io::Error::last_os_error()));
    }
    Ok(index)
}

fn bind_socket(config: &Config, ifindex: u32, port: u16) -> Result<Socket, TransportError> {
    let (domain, bind_addr): (Domain, SocketAddr) = match config.transport {
        TransportMode::Ipv4 => {
            (Domain::IPV4, SocketAddr::V4(SocketAddrV4::new(0u32.into(), port)))
        }
        TransportMode::Ipv6 => (
            Domain::IPV6,
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
        ),
    };

    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(TransportError::Setup)?;
    socket.set_reuse_address(true).map_err(TransportError::Setup)?;
    socket.set_nonblocking(true).map_err(TransportError::Setup)?;
    socket.bind(&bind_addr.into()).map_err(TransportError::Setup)?;

    match config.transport {
        TransportMode::Ipv4 => {
            socket
                .join_multicast_v4_n(
                    &PTP_PRIMARY_MULTICAST_V4,
                    &InterfaceIndexOrAddress::Index(ifindex),
                )
                .map_err(TransportError::Setup)?;
            socket
                .join_multicast_v4_n(
                    &PTP_PEER_MULTICAST_V4,
                    &InterfaceIndexOrAddress::Index(ifindex),
                )
                .map_err(TransportError::Setup)?;
            socket.set_multicast_ttl_v4(config.ttl).map_err(TransportError::Setup)?;
            if config.dscp != 0 {
                socket.set_tos((config.dscp as u32) << 2).map_err(TransportError::Setup)?;
            }
        }
        TransportMode::Ipv6 => {
            let primary = match config.ipv6_scope {
                Ipv6Scope::LinkLocal => PTP_PRIMARY_MULTICAST_V6_LINKLOCAL,
                Ipv6Scope::Global => PTP_PRIMARY_MULTICAST_V6_GLOBAL,
            };
            socket.join_multicast_v6(&primary, ifindex).map_err(TransportError::Setup)?;
            socket
                .join_multicast_v6(&PTP_PEER_MULTICAST_V6, ifindex)
                .map_err(TransportError::Setup)?;
            socket.set_multicast_if_v6(ifindex).map_err(TransportError::Setup)?;
            socket.set_multicast_hops_v6(config.ttl).map_err(TransportError::Setup)?;
            if config.dscp != 0 {
                let tclass: libc::c_int = ((config.dscp as u32) << 2) as libc::c_int;
                let rc = unsafe {
                    libc::setsockopt(
                        socket.as_raw_fd(),
                        libc::IPPROTO_IPV6,
                        libc::IPV6_TCLASS,
                        &tclass as *const _ as *const libc::c_void,
                        mem::size_of::<libc::c_int>() as libc::socklen_t,
                    )
                };
                if rc != 0 {
                    return Err(TransportError::Setup(io::Error::last_os_error()));
                }
            }
        }
    }

    // Per-packet interface info, best effort.
    let on: libc::c_int = 1;
    unsafe {
        match config.transport {
            TransportMode::Ipv4 => {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_PKTINFO,
                    &on as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
            TransportMode::Ipv6 => {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_RECVPKTINFO,
                    &on as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }
    }

    Ok(socket)
}

fn set_so_timestamping(fd: i32, flags: u32) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            &flags as *const _ as *const libc::c_void,
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_bool_sockopt(fd: i32, level: i32, name: i32) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Walk the fallback chain and return the level achieved.
fn enable_timestamping(socket: &Socket) -> Result<TimestampingMode, TransportError> {
    let fd = socket.as_raw_fd();

    let hw = SOF_TIMESTAMPING_TX_HARDWARE
        | SOF_TIMESTAMPING_RX_HARDWARE
        | SOF_TIMESTAMPING_RAW_HARDWARE;
    if set_so_timestamping(fd, hw).is_ok() {
        return Ok(TimestampingMode::Hardware);
    }
    debug!("hardware SO_TIMESTAMPING unavailable, trying software");

    let sw = SOF_TIMESTAMPING_TX_SOFTWARE
        | SOF_TIMESTAMPING_RX_SOFTWARE
        | SOF_TIMESTAMPING_SOFTWARE;
    if set_so_timestamping(fd, sw).is_ok() {
        return Ok(TimestampingMode::Software);
    }
    debug!("software SO_TIMESTAMPING unavailable, trying SO_TIMESTAMPNS");

    if set_bool_sockopt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS).is_ok() {
        return Ok(TimestampingMode::LegacyNs);
    }

    set_bool_sockopt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP)
        .map_err(TransportError::Setup)?;
    Ok(TimestampingMode::Legacy)
}

async fn recv_packet(socket: &AsyncFd<Socket>) -> Result<RxPacket, TransportError> {
    loop {
        let mut guard = socket.readable().await.map_err(TransportError::Recv)?;
        match recv_with_timestamp(socket.get_ref(), 0) {
            Ok(Some((data, from, timestamp))) => {
                let Some(from) = from else {
                    warn!("datagram without source address dropped");
                    continue;
                };
                if data.len() >= PACKET_SIZE {
                    warn!("dropping truncated {} byte datagram", data.len());
                    continue;
                }
                return Ok(RxPacket { data, from, timestamp });
            }
            Ok(None) => {
                guard.clear_ready();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                guard.clear_ready();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Recv(e)),
        }
    }
}

/// One nonblocking recvmsg. Returns Ok(None) on EAGAIN surfaced as a
/// zero-length read race.
fn recv_with_timestamp(
    socket: &Socket,
    flags: libc::c_int,
) -> io::Result<Option<(Vec<u8>, Option<SocketAddr>, Option<Timestamp>)>> {
    let mut buf = vec![0u8; PACKET_SIZE];
    let mut control = [0u8; 512];
    let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut addr as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, flags | libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(n as usize);

    let timestamp = unsafe { timestamp_from_cmsgs(&msg) };
    let from = sockaddr_to_std(&addr, msg.msg_namelen);
    Ok(Some((buf, from, timestamp)))
}

/// Read one looped-back PDU + TX timestamp from the error queue. Returns
/// Ok(None) when the message is not a timestamping loopback.
fn read_error_queue(socket: &Socket) -> io::Result<Option<TxTimestamp>> {
    let mut buf = vec![0u8; PACKET_SIZE];
    let mut control = [0u8; 512];

    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len();

    let n = unsafe {
        libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT)
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(n as usize);

    let (timestamp, origin_ok) = unsafe { errqueue_cmsgs(&msg) };
    if !origin_ok {
        debug!("error-queue message without timestamping origin, ignoring");
        return Ok(None);
    }
    let Some(timestamp) = timestamp else {
        return Ok(None);
    };
    Ok(Some(TxTimestamp { payload: buf, timestamp }))
}

unsafe fn timestamp_from_cmsgs(msg: &libc::msghdr) -> Option<Timestamp> {
    let mut result = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        if c.cmsg_level == libc::SOL_SOCKET {
            let data = unsafe { libc::CMSG_DATA(cmsg) };
            match c.cmsg_type {
                libc::SCM_TIMESTAMPING => {
                    let stamps =
                        unsafe { std::ptr::read_unaligned(data as *const [libc::timespec; 3]) };
                    // Index 2 is raw hardware, index 0 software.
                    let ts = if stamps[2].tv_sec != 0 || stamps[2].tv_nsec != 0 {
                        stamps[2]
                    } else {
                        stamps[0]
                    };
                    result = Some(Timestamp::from_secs_nanos(ts.tv_sec as u64, ts.tv_nsec as u32));
                }
                libc::SCM_TIMESTAMPNS => {
                    let ts = unsafe { std::ptr::read_unaligned(data as *const libc::timespec) };
                    result = result.or(Some(Timestamp::from_secs_nanos(
                        ts.tv_sec as u64,
                        ts.tv_nsec as u32,
                    )));
                }
                libc::SCM_TIMESTAMP => {
                    let tv = unsafe { std::ptr::read_unaligned(data as *const libc::timeval) };
                    result = result.or(Some(Timestamp::from_secs_nanos(
                        tv.tv_sec as u64,
                        (tv.tv_usec * 1000) as u32,
                    )));
                }
                _ => {}
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    result
}

/// Returns `(timestamp, origin_is_timestamping)` for an error-queue read.
unsafe fn errqueue_cmsgs(msg: &libc::msghdr) -> (Option<Timestamp>, bool) {
    let mut origin_ok = false;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        let data = unsafe { libc::CMSG_DATA(cmsg) };
        let is_recverr = (c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_RECVERR)
            || (c.cmsg_level == libc::IPPROTO_IPV6 && c.cmsg_type == libc::IPV6_RECVERR);
        if is_recverr {
            let err = unsafe { std::ptr::read_unaligned(data as *const libc::sock_extended_err) };
            origin_ok =
                err.ee_origin == SO_EE_ORIGIN_TIMESTAMPING && err.ee_errno == libc::ENOMSG as u32;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    (unsafe { timestamp_from_cmsgs(msg) }, origin_ok)
}

fn sockaddr_to_std(addr: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
    match addr.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            let a = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                u32::from_be(a.sin_addr.s_addr).into(),
                u16::from_be(a.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            let a = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(a.sin6_addr.s6_addr),
                u16::from_be(a.sin6_port),
                a.sin6_flowinfo,
                a.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// True when a destination address calls for the UNICAST header flag.
pub fn is_unicast_destination(dest: Option<SocketAddr>) -> bool {
    match dest {
        None => false,
        Some(addr) => match addr.ip() {
            IpAddr::V4(ip) => !ip.is_multicast(),
            IpAddr::V6(ip) => !ip.is_multicast(),
        },
    }
}
