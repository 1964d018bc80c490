//! Address Manager (AddrMan) for peer discovery
//!
//! Keeps every address heard from DNS seeds, configuration or `addr`
//! messages, one entry per host. Entries remember whether we ever tried
//! or managed to connect, so the dialer never hits the same host twice.

use crate::network::wire::{normalize_ip, NetAddr, ServiceFlags, TimestampedAddr};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

// =============================================================================
// Address Entry
// =============================================================================

/// Connection status of a known address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStatus {
    /// Heard about, never dialed
    Unknown,
    /// Dialed (or being dialed)
    ConnectionAttempted,
    /// Completed a handshake at least once
    Connected,
}

/// A known peer address
#[derive(Debug, Clone)]
pub struct NetworkAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub services: ServiceFlags,
    pub status: AddressStatus,
    /// Unix seconds the address was last advertised
    pub last_seen: u32,
    /// Number of connection attempts
    pub attempts: u32,
    /// Last connection attempt time
    pub last_attempt: Option<Instant>,
}

impl NetworkAddress {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        Self {
            ip: normalize_ip(ip),
            port,
            services,
            status: AddressStatus::Unknown,
            last_seen: now_secs(),
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Entry for an `addr` message
    pub fn to_timestamped(&self) -> TimestampedAddr {
        TimestampedAddr {
            time: self.last_seen,
            addr: NetAddr::new(self.ip, self.port, self.services),
        }
    }
}

fn now_secs() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

// =============================================================================
// Address Manager
// =============================================================================

/// Address book keyed by normalized IP
#[derive(Debug, Default)]
pub struct AddrManager {
    /// Entries in the order they were learned
    entries: Vec<NetworkAddress>,
    /// Normalized IP to index in `entries`
    by_ip: HashMap<IpAddr, usize>,
}

impl AddrManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of addresses
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an address. Port 0 and hosts already known are skipped.
    pub fn add(&mut self, ip: IpAddr, port: u16, services: ServiceFlags) -> bool {
        if port == 0 {
            return false;
        }
        let ip = normalize_ip(ip);
        if self.by_ip.contains_key(&ip) {
            return false;
        }

        self.by_ip.insert(ip, self.entries.len());
        self.entries.push(NetworkAddress::new(ip, port, services));
        true
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&NetworkAddress> {
        self.by_ip
            .get(&normalize_ip(*ip))
            .map(|&index| &self.entries[index])
    }

    fn get_mut(&mut self, ip: &IpAddr) -> Option<&mut NetworkAddress> {
        let index = *self.by_ip.get(&normalize_ip(*ip))?;
        self.entries.get_mut(index)
    }

    /// Addresses never dialed, oldest first
    pub fn unconnected(&self) -> Vec<SocketAddr> {
        self.entries
            .iter()
            .filter(|e| e.status == AddressStatus::Unknown)
            .map(NetworkAddress::socket_addr)
            .collect()
    }

    /// Record a connection attempt
    pub fn attempt(&mut self, ip: &IpAddr) -> bool {
        match self.get_mut(ip) {
            Some(entry) => {
                entry.attempts += 1;
                entry.last_attempt = Some(Instant::now());
                if entry.status == AddressStatus::Unknown {
                    entry.status = AddressStatus::ConnectionAttempted;
                }
                true
            }
            None => false,
        }
    }

    /// Record a completed handshake with a known host
    pub fn good(&mut self, ip: &IpAddr, services: ServiceFlags) -> bool {
        match self.get_mut(ip) {
            Some(entry) => {
                entry.status = AddressStatus::Connected;
                entry.services = services;
                entry.last_seen = now_secs();
                true
            }
            None => false,
        }
    }

    /// Up to `limit` addresses to advertise, most recently seen first
    pub fn sample(&self, limit: usize) -> Vec<TimestampedAddr> {
        let mut entries: Vec<&NetworkAddress> = self.entries.iter().collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        entries
            .into_iter()
            .take(limit)
            .map(NetworkAddress::to_timestamped)
            .collect()
    }
}
