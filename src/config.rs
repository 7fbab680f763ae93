//! System and client-open configuration.
//!
//! A `SystemConfig` is frozen at broker start; invalid combinations are
//! rejected before any socket opens. `OpenConfig` is the client-side
//! counterpart: where to look for a broker and how hard to try.

use crate::errors::{EtError, Result};
use crate::types::{CastMode, HostSpec, ResponsePolicy, DEFAULT_PORT, NAME_LENGTH_MAX};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Broker-side configuration, fixed at creation.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// System name; discovery requests must quote it exactly.
    pub name: String,
    /// Total events in the pool.
    pub nevents: usize,
    /// Fixed capacity of each event buffer, bytes.
    pub event_size: u64,
    /// Per-group event quotas. Must sum to `nevents`. A single group
    /// containing everything is the default.
    pub groups: Vec<usize>,
    /// Budget of simultaneously oversized events; 0 disables them.
    pub temp_max: usize,
    /// TCP server port.
    pub tcp_port: u16,
    /// UDP discovery port.
    pub udp_port: u16,
    /// Multicast groups the responder joins on every usable interface.
    pub mcast_addrs: Vec<Ipv4Addr>,
    pub tcp_nodelay: bool,
    /// Socket buffer sizes; 0 keeps the OS default.
    pub tcp_send_buf: usize,
    pub tcp_recv_buf: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "et_sys".into(),
            nevents: 2048,
            event_size: 4096,
            groups: Vec::new(),
            temp_max: 64,
            tcp_port: DEFAULT_PORT,
            udp_port: DEFAULT_PORT,
            mcast_addrs: Vec::new(),
            tcp_nodelay: true,
            tcp_send_buf: 0,
            tcp_recv_buf: 0,
        }
    }
}

impl SystemConfig {
    /// Normalize and validate. Fills in the implicit single group and
    /// refuses combinations the pipeline cannot honour.
    pub fn validate(mut self) -> Result<SystemConfig> {
        if self.name.is_empty() || self.name.len() > NAME_LENGTH_MAX {
            return Err(EtError::BadArg);
        }
        if self.nevents == 0 || self.event_size == 0 {
            return Err(EtError::BadArg);
        }
        if self.groups.is_empty() {
            self.groups = vec![self.nevents];
        }
        if self.groups.iter().any(|&g| g == 0)
            || self.groups.iter().sum::<usize>() != self.nevents
        {
            return Err(EtError::BadArg);
        }
        for addr in &self.mcast_addrs {
            if !addr.is_multicast() {
                return Err(EtError::BadArg);
            }
        }
        Ok(self)
    }

    /// Group index (0-based) an event place belongs to, given the quota
    /// layout: places are dealt out to groups in order.
    pub fn group_of(&self, place: usize) -> usize {
        let mut start = 0;
        for (i, &quota) in self.groups.iter().enumerate() {
            if place < start + quota {
                return i;
            }
            start += quota;
        }
        self.groups.len() - 1
    }
}

/// Client-side configuration for opening a broker.
#[derive(Debug, Clone)]
pub struct OpenConfig {
    pub host: HostSpec,
    pub cast: CastMode,
    pub policy: ResponsePolicy,
    /// UDP discovery port to probe.
    pub udp_port: u16,
    /// TCP port for `CastMode::Direct`.
    pub server_port: u16,
    pub mcast_addrs: Vec<Ipv4Addr>,
    /// Multicast TTL; 1 stays on the local segment.
    pub ttl: u32,
    /// Preferred local interface (regular or broadcast address); used to
    /// bind outgoing connections and to rank the broker's addresses.
    pub interface: Option<Ipv4Addr>,
    /// Discovery rounds before giving up (deadline grows each round).
    pub tries: usize,
    /// Total budget for open to keep retrying a missing broker;
    /// `None` fails after the first full discovery attempt.
    pub wait: Option<Duration>,
    pub tcp_nodelay: bool,
    pub tcp_send_buf: usize,
    pub tcp_recv_buf: usize,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            host: HostSpec::Anywhere,
            cast: CastMode::Broadcast,
            policy: ResponsePolicy::First,
            udp_port: DEFAULT_PORT,
            server_port: DEFAULT_PORT,
            mcast_addrs: Vec::new(),
            ttl: 1,
            interface: None,
            tries: 2,
            wait: None,
            tcp_nodelay: true,
            tcp_send_buf: 0,
            tcp_recv_buf: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = SystemConfig::default().validate().unwrap();
        assert_eq!(cfg.groups, vec![2048]);
    }

    #[test]
    fn group_quotas_must_cover_pool() {
        let cfg = SystemConfig {
            nevents: 10,
            groups: vec![4, 4],
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err(), EtError::BadArg);
    }

    #[test]
    fn group_of_deals_places_in_order() {
        let cfg = SystemConfig {
            nevents: 10,
            groups: vec![4, 6],
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(cfg.group_of(0), 0);
        assert_eq!(cfg.group_of(3), 0);
        assert_eq!(cfg.group_of(4), 1);
        assert_eq!(cfg.group_of(9), 1);
    }
}
