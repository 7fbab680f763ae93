//! UDP discovery: the broker-side responder and the client-side finder,
//! plus the endpoint selector that turns a discovery response into a
//! TCP connection.
//!
//! Request frame:  magic ×3 | version | name-len | name
//! Reply frame:    magic ×3 | version | tcp-port | cast-type |
//!                 cast-ip (legacy, always zero length) | uname | canon |
//!                 n × (binary-ip, dotted-ip) | n × dotted-broadcast
//!
//! The trailing broadcast table was appended to the frame later; a reply
//! whose second count disagrees with the first is treated as the older
//! form and subnet ordering degrades gracefully.

use crate::config::OpenConfig;
use crate::errors::{EtError, Result};
use crate::net::codec::{drain_datagrams, put_cstr, put_word, FrameReader};
use crate::net::iface::{self, LocalInterface};
use crate::net::sock;
use crate::net::types::{
    CAST_MULTICAST, DISCOVERY_BUF_SIZE, MAGIC, RESPONSE_ADDRS_MAX, VERSION,
};
use crate::types::{CastMode, HostSpec, ResponsePolicy, NAME_LENGTH_MAX};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, trace};

/// Per-attempt TCP connect deadline while walking a responder's
/// addresses.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Extra seconds of listening added per discovery round.
const ROUND_INCREMENTS: [u64; 6] = [0, 1, 2, 3, 4, 5];

/// Base listening time in the first round.
const ROUND_BASE: Duration = Duration::from_millis(100);

/// One broker's answer to a discovery request.
#[derive(Debug, Clone)]
pub struct Response {
    pub port: u16,
    pub cast_type: u32,
    /// Legacy field; current brokers always send it empty.
    pub cast_ip: String,
    pub uname: String,
    pub canon: String,
    pub addrs: Vec<Ipv4Addr>,
    /// Broadcast address per entry of `addrs`; `None` for older frames.
    pub bcasts: Option<Vec<Ipv4Addr>>,
    pub from: SocketAddr,
}

impl Response {
    /// Address/broadcast pairs for subnet ordering.
    pub fn addr_pairs(&self) -> Vec<(Ipv4Addr, Option<Ipv4Addr>)> {
        self.addrs
            .iter()
            .enumerate()
            .map(|(i, &a)| (a, self.bcasts.as_ref().map(|b| b[i])))
            .collect()
    }
}

// =============================================================================
// FRAMES
// =============================================================================

pub fn build_request(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 24);
    for m in MAGIC {
        put_word(&mut buf, m);
    }
    put_word(&mut buf, VERSION);
    put_cstr(&mut buf, name);
    buf
}

/// Parse a request; `None` silently drops bad magic, version, or length.
pub fn parse_request(buf: &[u8]) -> Option<String> {
    let mut rd = FrameReader::new(buf);
    for m in MAGIC {
        if rd.word().ok()? != m {
            return None;
        }
    }
    if rd.word().ok()? != VERSION {
        return None;
    }
    let name = rd.cstr(NAME_LENGTH_MAX + 1).ok()?;
    if name.is_empty() { None } else { Some(name) }
}

/// Interfaces the responder advertises. Falls back to loopback so a
/// broker on an interface-less host is still discoverable locally.
fn advertised_interfaces() -> Vec<LocalInterface> {
    let mut ifcs: Vec<LocalInterface> = iface::usable_interfaces()
        .into_iter()
        .filter(|i| i.broadcast.is_some())
        .collect();
    if ifcs.is_empty() {
        ifcs.push(LocalInterface {
            name: "lo".into(),
            addr: Ipv4Addr::LOCALHOST,
            netmask: Ipv4Addr::new(255, 0, 0, 0),
            broadcast: Some(Ipv4Addr::new(127, 255, 255, 255)),
        });
    }
    ifcs
}

/// Build the reply frame once; it never changes after startup.
pub fn build_response_frame(tcp_port: u16) -> Vec<u8> {
    let ifcs = advertised_interfaces();
    let uname = iface::uname();

    let mut buf = Vec::with_capacity(256);
    for m in MAGIC {
        put_word(&mut buf, m);
    }
    put_word(&mut buf, VERSION);
    put_word(&mut buf, tcp_port as u32);
    put_word(&mut buf, CAST_MULTICAST);
    // Legacy cast-IP: always sent, always empty.
    put_word(&mut buf, 0);
    put_cstr(&mut buf, &uname);
    put_cstr(&mut buf, &uname);

    put_word(&mut buf, ifcs.len() as u32);
    for ifc in &ifcs {
        buf.extend_from_slice(&ifc.addr.octets());
        put_cstr(&mut buf, &ifc.addr.to_string());
    }

    // The appended broadcast table; repeating the count lets old peers
    // stop short and new peers verify.
    put_word(&mut buf, ifcs.len() as u32);
    for ifc in &ifcs {
        let b = ifc.broadcast.unwrap_or(Ipv4Addr::BROADCAST);
        put_cstr(&mut buf, &b.to_string());
    }
    buf
}

/// Parse a reply; `None` drops bad magic/version/shape.
pub fn parse_response(buf: &[u8], from: SocketAddr) -> Option<Response> {
    let mut rd = FrameReader::new(buf);
    for m in MAGIC {
        if rd.word().ok()? != m {
            return None;
        }
    }
    if rd.word().ok()? != VERSION {
        return None;
    }
    let port = rd.word().ok()?;
    if port == 0 || port > u16::MAX as u32 {
        return None;
    }
    let cast_type = rd.word().ok()?;
    let cast_ip = rd.cstr(64).ok()?;
    let uname = rd.cstr(NAME_LENGTH_MAX + 1).ok()?;
    if uname.is_empty() {
        return None;
    }
    let canon = rd.cstr(NAME_LENGTH_MAX + 1).ok()?;

    let count = rd.word().ok()? as usize;
    if count == 0 || count > RESPONSE_ADDRS_MAX {
        return None;
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = rd.raw_word().ok()?;
        let dotted = rd.cstr(64).ok()?;
        let bin = Ipv4Addr::from(raw);
        // Prefer the dotted form when both parse; they should agree.
        addrs.push(dotted.parse().unwrap_or(bin));
    }

    // Broadcast table, present in current frames only.
    let bcasts = match rd.word() {
        Ok(n) if n as usize == count => {
            let mut list = Vec::with_capacity(count);
            let mut ok = true;
            for _ in 0..count {
                match rd.cstr(64).ok().and_then(|s| s.parse().ok()) {
                    Some(b) => list.push(b),
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok { Some(list) } else { None }
        }
        _ => None,
    };

    Some(Response {
        port: port as u16,
        cast_type,
        cast_ip,
        uname,
        canon,
        addrs,
        bcasts,
        from,
    })
}

// =============================================================================
// RESPONDER
// =============================================================================

/// Broker-side discovery thread: answer requests quoting our name, drop
/// everything else without a reply. Runs until the socket dies or the
/// task is aborted.
pub async fn responder(name: String, udp_port: u16, mcast: Vec<Ipv4Addr>, tcp_port: u16) -> Result<()> {
    let socket = sock::udp_receive_all(udp_port, &mcast)?;
    let frame = build_response_frame(tcp_port);
    let mut buf = vec![0u8; DISCOVERY_BUF_SIZE];

    info!(udp_port, tcp_port, "discovery responder listening");
    loop {
        let (len, from) = socket.recv_from(&mut buf).await.map_err(|_| EtError::Read)?;
        match parse_request(&buf[..len]) {
            Some(requested) if requested == name => {
                trace!(%from, "discovery hit");
                let _ = socket.send_to(&frame, from).await;
            }
            _ => {}
        }
    }
}

// =============================================================================
// FINDER (client side)
// =============================================================================

/// Pick a response per policy, or `None` to keep listening.
/// `target_ips` is the resolved address set for specific/local host
/// specs; unused otherwise.
pub fn choose_response(
    responses: &[Response],
    host: &HostSpec,
    policy: ResponsePolicy,
    local_uname: &str,
    target_ips: &[Ipv4Addr],
) -> Result<Option<Response>> {
    if responses.is_empty() {
        return Ok(None);
    }

    match host {
        HostSpec::Local | HostSpec::Host(_) => {
            // Another broker of the same name elsewhere may answer too;
            // only the one on the wanted host counts.
            for r in responses {
                if r.addrs.iter().any(|a| target_ips.contains(a)) {
                    return Ok(Some(r.clone()));
                }
            }
            Ok(None)
        }

        HostSpec::Anywhere => {
            if policy == ResponsePolicy::Error && responses.len() > 1 {
                let first = &responses[0];
                if responses[1..].iter().any(|r| r.uname != first.uname) {
                    return Err(EtError::TooMany);
                }
                // Multi-homed single host: the extra answers collapse.
                return Ok(Some(first.clone()));
            }
            match policy {
                ResponsePolicy::First | ResponsePolicy::Error => Ok(Some(responses[0].clone())),
                ResponsePolicy::Local => Ok(Some(
                    responses
                        .iter()
                        .find(|r| r.uname == local_uname)
                        .unwrap_or(&responses[0])
                        .clone(),
                )),
            }
        }

        HostSpec::Remote => {
            let remotes: Vec<&Response> =
                responses.iter().filter(|r| r.uname != local_uname).collect();
            match remotes.as_slice() {
                [] => Ok(None),
                [only] => Ok(Some((*only).clone())),
                [first, rest @ ..] => match policy {
                    // Local makes no sense here and falls back to First.
                    ResponsePolicy::First | ResponsePolicy::Local => Ok(Some((*first).clone())),
                    ResponsePolicy::Error => {
                        if rest.iter().any(|r| r.uname != first.uname) {
                            Err(EtError::TooMany)
                        } else {
                            Ok(Some((*first).clone()))
                        }
                    }
                },
            }
        }
    }
}

/// Broadcast/multicast for a broker named `name`, growing the listening
/// window each round, and settle on a responder per the configured
/// policy. Errors with `Timeout` when the retry budget is spent silent.
pub async fn find_broker(name: &str, config: &OpenConfig) -> Result<Response> {
    let local_uname = iface::uname();

    // Resolve the address set the answer must match for pinned specs.
    let target_ips: Vec<Ipv4Addr> = match &config.host {
        HostSpec::Local => {
            let mut ips = iface::local_addrs();
            ips.push(Ipv4Addr::LOCALHOST);
            ips
        }
        HostSpec::Host(h) => iface::resolve_host(h).await?,
        _ => Vec::new(),
    };

    // One socket per broadcast subnet, one per multicast group.
    let mut senders: Vec<(UdpSocket, SocketAddr)> = Vec::new();
    if matches!(config.cast, CastMode::Broadcast | CastMode::BroadAndMulticast) {
        let mut bcasts = iface::broadcast_addrs();
        // The loopback subnet reaches same-host brokers even with no
        // usable interface.
        if !matches!(config.host, HostSpec::Remote) {
            bcasts.push(Ipv4Addr::new(127, 255, 255, 255));
        }
        for b in bcasts {
            let socket = sock::udp_broadcast_sender()?;
            senders.push((socket, SocketAddr::V4(SocketAddrV4::new(b, config.udp_port))));
        }
    }
    if matches!(config.cast, CastMode::Multicast | CastMode::BroadAndMulticast) {
        for &group in &config.mcast_addrs {
            let socket = sock::udp_multicast_sender(config.ttl)?;
            senders.push((socket, SocketAddr::V4(SocketAddrV4::new(group, config.udp_port))));
        }
    }
    if senders.is_empty() {
        return Err(EtError::BadArg);
    }

    let request = build_request(name);
    let mut buf = vec![0u8; DISCOVERY_BUF_SIZE];
    let tries = config.tries.clamp(1, ROUND_INCREMENTS.len());
    let mut responses: Vec<Response> = Vec::new();

    for round in 0..tries {
        for (socket, dest) in &senders {
            if let Err(e) = socket.send_to(&request, *dest).await {
                debug!(%dest, error = %e, "discovery send failed");
            }
        }

        let window = ROUND_BASE + Duration::from_secs(ROUND_INCREMENTS[round]);
        tokio::time::sleep(window).await;

        for (socket, _) in &senders {
            drain_datagrams(socket, &mut buf, |frame, from| {
                if let Some(r) = parse_response(frame, from) {
                    debug!(%from, uname = %r.uname, port = r.port, "discovery response");
                    responses.push(r);
                }
            });
        }

        if let Some(chosen) =
            choose_response(&responses, &config.host, config.policy, &local_uname, &target_ips)?
        {
            return Ok(chosen);
        }
    }

    Err(EtError::Timeout)
}

// =============================================================================
// ENDPOINT SELECTOR
// =============================================================================

/// Try the responder's addresses in subnet-preference order, three
/// seconds per attempt; first success wins.
pub async fn connect_to_response(
    response: &Response,
    config: &OpenConfig,
) -> Result<(TcpStream, Ipv4Addr)> {
    let local = iface::usable_interfaces();
    let (bind_ip, preferred_bcast) = match config.interface {
        Some(ip) => (iface::matching_local_ip(ip), iface::broadcast_for(ip)),
        None => (None, None),
    };

    let ordered = iface::order_ip_addrs(&response.addr_pairs(), &local, preferred_bcast);
    for addr in ordered {
        debug!(%addr, port = response.port, "trying broker address");
        match sock::tcp_connect(
            SocketAddr::V4(SocketAddrV4::new(addr, response.port)),
            bind_ip,
            config.tcp_nodelay,
            config.tcp_send_buf,
            config.tcp_recv_buf,
            Some(CONNECT_ATTEMPT_TIMEOUT),
        )
        .await
        {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => debug!(%addr, error = %e, "attempt failed"),
        }
    }
    Err(EtError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(uname: &str, addrs: &[[u8; 4]]) -> Response {
        Response {
            port: 11111,
            cast_type: CAST_MULTICAST,
            cast_ip: String::new(),
            uname: uname.into(),
            canon: uname.into(),
            addrs: addrs.iter().map(|&a| a.into()).collect(),
            bcasts: None,
            from: "127.0.0.1:9".parse().unwrap(),
        }
    }

    #[test]
    fn reply_frame_round_trips() {
        let frame = build_response_frame(12345);
        let r = parse_response(&frame, "127.0.0.1:9".parse().unwrap()).unwrap();
        assert_eq!(r.port, 12345);
        assert!(!r.addrs.is_empty());
        assert_eq!(r.bcasts.as_ref().map(|b| b.len()), Some(r.addrs.len()));
        assert!(r.cast_ip.is_empty());
    }

    #[test]
    fn request_gate_drops_wrong_version() {
        let mut frame = build_request("sys");
        assert_eq!(parse_request(&frame).as_deref(), Some("sys"));
        frame[13] ^= 0xff;
        assert_eq!(parse_request(&frame), None);
    }

    #[test]
    fn old_frame_without_broadcast_table_still_parses() {
        let frame = build_response_frame(11111);
        let r_new = parse_response(&frame, "127.0.0.1:9".parse().unwrap()).unwrap();
        // Chop the appended table off; count word mismatch marks the
        // older form.
        let bcast_len: usize =
            4 + r_new.bcasts.unwrap().iter().map(|b| 4 + b.to_string().len() + 1).sum::<usize>();
        let old = &frame[..frame.len() - bcast_len];
        let r_old = parse_response(old, "127.0.0.1:9".parse().unwrap()).unwrap();
        assert_eq!(r_old.addrs, r_new.addrs);
        assert!(r_old.bcasts.is_none());
    }

    #[test]
    fn anywhere_error_policy_collapses_multihomed_host() {
        let responses = vec![
            resp("hostA", &[[10, 0, 1, 1]]),
            resp("hostA", &[[10, 0, 2, 1]]),
            resp("hostA", &[[172, 16, 0, 1]]),
        ];
        let chosen = choose_response(
            &responses,
            &HostSpec::Anywhere,
            ResponsePolicy::Error,
            "me",
            &[],
        )
        .unwrap()
        .unwrap();
        assert_eq!(chosen.addrs, responses[0].addrs);
    }

    #[test]
    fn anywhere_error_policy_rejects_two_hosts() {
        let responses = vec![resp("hostA", &[[10, 0, 1, 1]]), resp("hostB", &[[10, 0, 2, 1]])];
        assert_eq!(
            choose_response(&responses, &HostSpec::Anywhere, ResponsePolicy::Error, "me", &[])
                .unwrap_err(),
            EtError::TooMany
        );
    }

    #[test]
    fn local_policy_prefers_own_uname() {
        let responses = vec![resp("other", &[[10, 0, 1, 1]]), resp("me", &[[10, 0, 2, 1]])];
        let chosen = choose_response(
            &responses,
            &HostSpec::Anywhere,
            ResponsePolicy::Local,
            "me",
            &[],
        )
        .unwrap()
        .unwrap();
        assert_eq!(chosen.uname, "me");
    }

    #[test]
    fn remote_spec_skips_local_responder() {
        let responses = vec![resp("me", &[[10, 0, 1, 1]]), resp("far", &[[10, 0, 2, 1]])];
        let chosen =
            choose_response(&responses, &HostSpec::Remote, ResponsePolicy::First, "me", &[])
                .unwrap()
                .unwrap();
        assert_eq!(chosen.uname, "far");

        let only_local = vec![resp("me", &[[10, 0, 1, 1]])];
        assert!(
            choose_response(&only_local, &HostSpec::Remote, ResponsePolicy::First, "me", &[])
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn pinned_host_matches_on_address() {
        let responses = vec![resp("a", &[[10, 0, 1, 1]]), resp("b", &[[10, 0, 2, 1]])];
        let chosen = choose_response(
            &responses,
            &HostSpec::Host("b.example".into()),
            ResponsePolicy::First,
            "me",
            &[Ipv4Addr::new(10, 0, 2, 1)],
        )
        .unwrap()
        .unwrap();
        assert_eq!(chosen.uname, "b");
    }
}
