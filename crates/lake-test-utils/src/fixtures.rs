//! Fixture builders with sensible defaults.

use chrono::{DateTime, Duration, TimeZone, Utc};

use lake_indexer::sources::{
    Circuit, ClusterNode, EpochDistribution, GeoIpRecord, LatencySample, ValidatorDebt, VoteAccount,
};

/// A gossip peer at `ip:8001`.
pub fn node(pubkey: &str, ip: &str) -> ClusterNode {
    ClusterNode {
        pubkey: pubkey.to_string(),
        gossip: Some(format!("{ip}:8001")),
        tpu: Some(format!("{ip}:8003")),
        rpc: None,
        version: Some("2.0.0".to_string()),
        shred_version: Some(50093),
    }
}

/// A vote account that has earned `credits` so far in `epoch`.
pub fn vote_account(vote_pubkey: &str, node_pubkey: &str, epoch: u64, credits: u64) -> VoteAccount {
    VoteAccount {
        vote_pubkey: vote_pubkey.to_string(),
        node_pubkey: node_pubkey.to_string(),
        activated_stake: 1_000_000_000,
        commission: 5,
        last_vote: 1_000,
        root_slot: 968,
        epoch_credits: vec![(epoch, 10_000 + credits, 10_000)],
        delinquent: false,
    }
}

/// A distribution for `epoch` owed by `validators` (`(node, debt)` pairs).
pub fn distribution(epoch: u64, validators: &[(&str, u64)]) -> EpochDistribution {
    EpochDistribution {
        epoch,
        total_revenue_lamports: 1_000 * epoch,
        total_debt_lamports: validators.iter().map(|(_, debt)| debt).sum(),
        validators: validators
            .iter()
            .map(|(node, debt)| ValidatorDebt {
                node_pubkey: (*node).to_string(),
                debt_lamports: *debt,
                paid_lamports: 0,
            })
            .collect(),
    }
}

/// A WAN circuit between two sites.
pub fn circuit(code: &str) -> Circuit {
    Circuit {
        code: code.to_string(),
        origin: format!("{code}-a"),
        target: format!("{code}-z"),
        link_type: "wan".to_string(),
    }
}

/// Base time for sample fixtures.
pub fn sample_epoch_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

/// A latency sample one second after the previous index; `rtt_us = 0`
/// marks a loss.
pub fn sample(index: u64, rtt_us: u32) -> LatencySample {
    LatencySample {
        index,
        time: sample_epoch_start() + Duration::seconds(i64::try_from(index).unwrap()),
        rtt_us,
    }
}

/// A GeoIP record in `city`.
pub fn geoip(ip: &str, city: &str) -> GeoIpRecord {
    GeoIpRecord {
        ip: ip.parse().unwrap(),
        country_code: Some("DE".to_string()),
        country: Some("Germany".to_string()),
        region: None,
        city: Some(city.to_string()),
        latitude: Some(50.1),
        longitude: Some(8.7),
        asn: Some(24940),
        org: Some("Hetzner".to_string()),
    }
}
