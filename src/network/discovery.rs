//! Peer Discovery for P2P networking
//!
//! Resolves DNS seeds (or literal addresses) into the peer directory,
//! retrying with bounded exponential backoff while nothing comes back.

use crate::network::message::Network;
use crate::network::peer::PeerDirectory;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Default DNS Seeds
// =============================================================================

pub const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitcoin.jonasschnelli.ch",
    "seed.btc.petertodd.org",
    "seed.bitcoin.sprovoost.nl",
    "dnsseed.emzy.de",
    "seed.bitcoin.wiz.biz",
];

pub const TESTNET_DNS_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "seed.testnet.bitcoin.sprovoost.nl",
    "testnet-seed.bluematt.me",
];

pub const SIGNET_DNS_SEEDS: &[&str] = &["seed.signet.bitcoin.sprovoost.nl"];

/// Seeds for a network; regtest has none
pub fn default_seeds(network: Network) -> Vec<String> {
    let seeds: &[&str] = match network {
        Network::Main => MAINNET_DNS_SEEDS,
        Network::Testnet => TESTNET_DNS_SEEDS,
        Network::Signet => SIGNET_DNS_SEEDS,
        Network::Regtest => &[],
    };
    seeds.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve `host`, `host:port`, `ip` or `ip:port`
pub async fn resolve_seed(seed: &str, default_port: u16) -> io::Result<Vec<SocketAddr>> {
    if let Ok(addr) = seed.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }
    if let Ok(ip) = seed.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, default_port)]);
    }

    let has_port = seed
        .rsplit_once(':')
        .map_or(false, |(host, port)| !host.contains(':') && port.parse::<u16>().is_ok());
    let target = if has_port {
        seed.to_string()
    } else {
        format!("{}:{}", seed, default_port)
    };
    Ok(tokio::net::lookup_host(target).await?.collect())
}

/// Result of a bootstrap run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub attempts: u32,
    /// New addresses recorded
    pub added: usize,
}

/// Seeds the peer directory
pub struct PeerDiscovery {
    seeds: Vec<String>,
    default_port: u16,
    policy: RetryPolicy,
    directory: Arc<PeerDirectory>,
}

impl PeerDiscovery {
    pub fn new(
        seeds: Vec<String>,
        default_port: u16,
        policy: RetryPolicy,
        directory: Arc<PeerDirectory>,
    ) -> Self {
        Self {
            seeds,
            default_port,
            policy,
            directory,
        }
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// Resolve every seed once, returning the number of new addresses
    pub async fn resolve_once(&self) -> usize {
        let mut added = 0;
        for seed in &self.seeds {
            match resolve_seed(seed, self.default_port).await {
                Ok(addrs) => {
                    let mut new = 0;
                    for addr in &addrs {
                        if self.directory.add_address(addr.ip(), addr.port()).await {
                            new += 1;
                        }
                    }
                    log::debug!("Seed {} gave {} addresses, {} new", seed, addrs.len(), new);
                    added += new;
                }
                Err(e) => log::warn!("Failed to resolve seed {}: {}", seed, e),
            }
        }
        added
    }

    /// Resolve seeds until the directory knows at least one address or the
    /// policy runs out of attempts
    pub async fn bootstrap(&self) -> SeedReport {
        let mut report = SeedReport::default();
        if self.seeds.is_empty() {
            return report;
        }

        while report.attempts < self.policy.max_attempts {
            report.added += self.resolve_once().await;
            report.attempts += 1;

            if self.directory.address_count().await > 0 {
                log::info!(
                    "Discovered {} addresses from {} seeds",
                    report.added,
                    self.seeds.len()
                );
                return report;
            }

            if report.attempts < self.policy.max_attempts {
                let delay = self.policy.delay_for(report.attempts - 1);
                log::info!(
                    "No peer addresses yet, retrying seeds in {:?} ({}/{})",
                    delay,
                    report.attempts,
                    self.policy.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }

        log::warn!(
            "Seed resolution gave no addresses after {} attempts",
            report.attempts
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_default_seeds() {
        assert_eq!(default_seeds(Network::Main).len(), MAINNET_DNS_SEEDS.len());
        assert!(default_seeds(Network::Regtest).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_literals() {
        assert_eq!(
            resolve_seed("127.0.0.1:18444", 8333).await.unwrap(),
            vec!["127.0.0.1:18444".parse().unwrap()]
        );
        assert_eq!(
            resolve_seed("10.1.1.1", 8333).await.unwrap(),
            vec!["10.1.1.1:8333".parse().unwrap()]
        );
        assert_eq!(
            resolve_seed("::1", 8333).await.unwrap(),
            vec!["[::1]:8333".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_bootstrap_fills_directory() {
        let directory = Arc::new(PeerDirectory::new());
        let discovery = PeerDiscovery::new(
            vec!["10.0.0.1".into(), "10.0.0.2:18333".into(), "10.0.0.1".into()],
            8333,
            fast_policy(3),
            directory.clone(),
        );

        let report = discovery.bootstrap().await;
        assert_eq!(report, SeedReport { attempts: 1, added: 2 });
        assert_eq!(directory.address_count().await, 2);
    }

    #[tokio::test]
    async fn test_bootstrap_gives_up() {
        let directory = Arc::new(PeerDirectory::new());
        // Port 0 is never recorded
        let discovery = PeerDiscovery::new(
            vec!["10.0.0.1:0".into()],
            8333,
            fast_policy(3),
            directory.clone(),
        );

        let report = discovery.bootstrap().await;
        assert_eq!(report, SeedReport { attempts: 3, added: 0 });
        assert_eq!(directory.address_count().await, 0);
    }

    #[tokio::test]
    async fn test_no_seeds() {
        let discovery = PeerDiscovery::new(
            Vec::new(),
            8333,
            fast_policy(3),
            Arc::new(PeerDirectory::new()),
        );
        assert_eq!(discovery.bootstrap().await, SeedReport::default());
    }
}
