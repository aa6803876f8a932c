//! Host ban list.
//!
//! Hosts that serve unverifiable fork-replacement blocks are banned for
//! `local_ban_time`, doubled on every repeat offense and capped at
//! `max_ban_time`. Bans lapse on their own; the offense count does not.

use crate::config::BanConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub trait BanService: Send + Sync {
    fn register_bad_block(&self, host: &str, block_id: u64, block_time: i64, reason: &str);

    /// Drops every host that is currently banned, keeping order.
    fn filter_banned_hosts(&self, hosts: Vec<String>) -> Vec<String>;

    fn is_banned(&self, host: &str) -> bool;
}

#[derive(Debug, Clone)]
struct BanEntry {
    offenses: u32,
    until: Instant,
    block_id: u64,
    reason: String,
}

pub struct BanList {
    bans: RwLock<HashMap<String, BanEntry>>,
    local_ban_time: Duration,
    max_ban_time: Duration,
}

impl BanList {
    pub fn new(config: &BanConfig) -> Self {
        Self {
            bans: RwLock::new(HashMap::new()),
            local_ban_time: config.local_ban_time,
            max_ban_time: config.max_ban_time,
        }
    }

    fn ban_duration(&self, offenses: u32) -> Duration {
        let factor = 1u32.checked_shl(offenses.saturating_sub(1)).unwrap_or(u32::MAX);
        self.local_ban_time
            .checked_mul(factor)
            .unwrap_or(self.max_ban_time)
            .min(self.max_ban_time)
    }

    pub fn offenses(&self, host: &str) -> u32 {
        self.bans.read().get(host).map(|e| e.offenses).unwrap_or(0)
    }

    /// Time left on the host's ban, if any.
    pub fn remaining(&self, host: &str) -> Option<Duration> {
        let bans = self.bans.read();
        let entry = bans.get(host)?;
        let now = Instant::now();
        (entry.until > now).then(|| entry.until - now)
    }
}

impl BanService for BanList {
    fn register_bad_block(&self, host: &str, block_id: u64, block_time: i64, reason: &str) {
        let mut bans = self.bans.write();
        let offenses = bans.get(host).map(|e| e.offenses).unwrap_or(0) + 1;
        let duration = self.ban_duration(offenses);
        warn!(
            host = %host,
            block_id,
            block_time,
            offenses,
            ban_secs = duration.as_secs(),
            reason,
            "banning host for bad block"
        );
        bans.insert(
            host.to_string(),
            BanEntry {
                offenses,
                until: Instant::now() + duration,
                block_id,
                reason: reason.to_string(),
            },
        );
    }

    fn filter_banned_hosts(&self, hosts: Vec<String>) -> Vec<String> {
        let bans = self.bans.read();
        let now = Instant::now();
        hosts
            .into_iter()
            .filter(|host| bans.get(host).map_or(true, |e| e.until <= now))
            .collect()
    }

    fn is_banned(&self, host: &str) -> bool {
        self.remaining(host).is_some()
    }
}

impl std::fmt::Debug for BanList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bans = self.bans.read();
        let mut list = f.debug_map();
        for (host, entry) in bans.iter() {
            list.entry(host, &(entry.offenses, entry.block_id, &entry.reason));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> BanList {
        BanList::new(&BanConfig {
            local_ban_time: Duration::from_secs(60),
            max_ban_time: Duration::from_secs(300),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_host_filtered_until_expiry() {
        let bans = list();
        bans.register_bad_block("10.0.0.2:7078", 40, 1_700_000_000, "bad signature");

        let hosts = vec!["10.0.0.1:7078".to_string(), "10.0.0.2:7078".to_string()];
        assert_eq!(bans.filter_banned_hosts(hosts.clone()), vec!["10.0.0.1:7078"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(bans.filter_banned_hosts(hosts), vec!["10.0.0.1:7078", "10.0.0.2:7078"]);
    }

    #[test]
    fn test_ban_duration_doubles_up_to_cap() {
        let bans = list();
        assert_eq!(bans.ban_duration(1), Duration::from_secs(60));
        assert_eq!(bans.ban_duration(2), Duration::from_secs(120));
        assert_eq!(bans.ban_duration(3), Duration::from_secs(240));
        assert_eq!(bans.ban_duration(4), Duration::from_secs(300));
        assert_eq!(bans.ban_duration(40), Duration::from_secs(300));
    }

    #[test]
    fn test_repeat_offense_counted() {
        let bans = list();
        bans.register_bad_block("peer", 1, 0, "a");
        bans.register_bad_block("peer", 2, 0, "b");
        assert_eq!(bans.offenses("peer"), 2);
        assert!(bans.is_banned("peer"));
        assert!(!bans.is_banned("other"));
    }
}
