//! Replica status reported by a volume's control process
//!
//! The engine answers with a JSON array of [`ReplicaStatus`]. Older engines
//! print one replica per line instead:
//!
//! ```text
//! ADDRESS              MODE CHAIN
//! tcp://10.0.0.1:9502  RW   [volume-head-002.img volume-snap-a.img]
//! tcp://10.0.0.2:9502  WO   []
//! ```
//!
//! Both decode into the same entries and go through [`classify`].

use crate::common::{Error, ReplicaInfo, ReplicaMode, Result};
use serde::{Deserialize, Serialize};

const HEAD_PREFIX: &str = "volume-head-";

/// One raw entry of a replica listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub address: String,
    pub mode: String,
    #[serde(default)]
    pub chain: Vec<String>,
}

/// Parse one legacy status line: `<address> <MODE> [chain...]`
pub fn parse_status_line(line: &str) -> Result<ReplicaStatus> {
    let mut fields = line.split_whitespace();
    let (address, mode) = match (fields.next(), fields.next()) {
        (Some(address), Some(mode)) => (address, mode),
        _ => {
            return Err(Error::ParseStatus(format!("cannot parse line `{}`", line)));
        }
    };
    let rest: Vec<&str> = fields.collect();
    let joined = rest.join(" ");
    let inner = joined
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(&joined);

    Ok(ReplicaStatus {
        address: address.to_string(),
        mode: mode.to_string(),
        chain: inner.split_whitespace().map(str::to_string).collect(),
    })
}

/// Parse a whole legacy listing, skipping blank and header lines.
pub fn parse_status_listing(output: &str) -> Result<Vec<ReplicaStatus>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("ADDRESS"))
        .map(|l| {
            parse_status_line(l).map_err(|e| {
                Error::ParseStatus(format!("error parsing replica status from `{}`: {}", l, e))
            })
        })
        .collect()
}

/// Chain without its leading volume-head element
pub fn trim_chain(chain: &[String]) -> &[String] {
    match chain.first() {
        Some(first) if first.starts_with(HEAD_PREFIX) => &chain[1..],
        _ => chain,
    }
}

/// Turn raw entries into observed replicas.
///
/// Unknown modes and RW replicas with an empty chain become ERR. Every RW
/// replica must report the same chain once the head is trimmed.
pub fn classify(entries: Vec<ReplicaStatus>) -> Result<Vec<ReplicaInfo>> {
    let mut reference: Option<Vec<String>> = None;
    let mut replicas = Vec::with_capacity(entries.len());

    for entry in entries {
        let mut mode = ReplicaMode::from_token(&entry.mode);
        if mode == ReplicaMode::RW {
            if entry.chain.is_empty() {
                tracing::warn!(
                    "Replica {} reports RW with an empty chain, treating as ERR",
                    entry.address
                );
                mode = ReplicaMode::ERR;
            } else {
                let chain = trim_chain(&entry.chain).to_vec();
                match &reference {
                    None => reference = Some(chain),
                    Some(expected) if *expected != chain => {
                        return Err(Error::ChainMismatch {
                            expected: expected.join(" "),
                            actual: chain.join(" "),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        replicas.push(ReplicaInfo::observed(entry.address, mode));
    }

    Ok(replicas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes(replicas: &[ReplicaInfo]) -> Vec<ReplicaMode> {
        replicas.iter().filter_map(|r| r.mode).collect()
    }

    #[test]
    fn test_parse_rw_line() {
        let entry =
            parse_status_line("tcp://host:9502 RW [volume-head-001.img volume-snap-a.img]")
                .unwrap();
        assert_eq!(entry.address, "tcp://host:9502");
        assert_eq!(entry.mode, "RW");
        assert_eq!(entry.chain, vec!["volume-head-001.img", "volume-snap-a.img"]);

        let replicas = classify(vec![entry]).unwrap();
        assert_eq!(replicas[0].instance.address, "tcp://host:9502");
        assert_eq!(replicas[0].mode, Some(ReplicaMode::RW));
    }

    #[test]
    fn test_empty_chain_is_err() {
        let bare = parse_status_line("tcp://host:9502 RW").unwrap();
        let brackets = parse_status_line("tcp://host2:9502 RW []").unwrap();
        assert!(bare.chain.is_empty());
        assert!(brackets.chain.is_empty());
        assert_eq!(
            modes(&classify(vec![bare, brackets]).unwrap()),
            vec![ReplicaMode::ERR, ReplicaMode::ERR]
        );
    }

    #[test]
    fn test_unknown_mode_is_err() {
        let entry = parse_status_line("tcp://host:9502 REBUILDING [volume-head-001.img]").unwrap();
        assert_eq!(modes(&classify(vec![entry]).unwrap()), vec![ReplicaMode::ERR]);
    }

    #[test]
    fn test_short_line_rejected() {
        assert!(parse_status_line("tcp://host:9502").is_err());
        assert!(parse_status_line("").is_err());
    }

    #[test]
    fn test_chain_mismatch() {
        let listing = "\
ADDRESS MODE CHAIN
tcp://a:9502 RW [volume-head-002.img volume-snap-x.img]
tcp://b:9502 RW [volume-head-007.img volume-snap-y.img]
";
        let entries = parse_status_listing(listing).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            classify(entries),
            Err(Error::ChainMismatch { .. })
        ));
    }

    #[test]
    fn test_head_ignored_in_chain_comparison() {
        let listing = "\
ADDRESS MODE CHAIN
tcp://a:9502 RW [volume-head-002.img volume-snap-x.img]
tcp://b:9502 RW [volume-head-005.img volume-snap-x.img]
tcp://c:9502 WO [volume-head-001.img]

";
        let replicas = classify(parse_status_listing(listing).unwrap()).unwrap();
        assert_eq!(
            modes(&replicas),
            vec![ReplicaMode::RW, ReplicaMode::RW, ReplicaMode::WO]
        );
    }

    #[test]
    fn test_structured_status() {
        let json = r#"[
            {"address":"tcp://a:9502","mode":"RW","chain":["volume-head-001.img","volume-snap-s.img"]},
            {"address":"tcp://b:9502","mode":"ERR"}
        ]"#;
        let entries: Vec<ReplicaStatus> = serde_json::from_str(json).unwrap();
        let replicas = classify(entries).unwrap();
        assert_eq!(modes(&replicas), vec![ReplicaMode::RW, ReplicaMode::ERR]);
    }
}
