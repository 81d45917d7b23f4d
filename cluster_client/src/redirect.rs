//! Parses `MOVED`/`ASK`/`TRYAGAIN` error replies, per the error-shape
//! notes and the cluster façade's redirect handling.

use crate::hash_slot::HashSlot;
use crate::node_id::{parse_address, NodeId};

#[derive(Debug, Clone, PartialEq)]
pub enum Redirect {
    Moved { slot: HashSlot, target: NodeId },
    Ask { slot: HashSlot, target: NodeId },
    TryAgain,
    ClusterDown,
    MasterDown,
    Loading,
    Other(String),
}

/// Classifies a server error message. Returns `None` for error shapes
/// that aren't cluster-redirect related (e.g. `WRONGTYPE`).
pub fn classify_error(message: &str) -> Option<Redirect> {
    let mut parts = message.split_whitespace();
    match parts.next()? {
        "MOVED" => {
            let slot: u16 = parts.next()?.parse().ok()?;
            let (host, port) = parse_address(parts.next()?)?;
            Some(Redirect::Moved {
                slot: HashSlot::try_from(slot).ok()?,
                target: NodeId::new(host, port),
            })
        }
        "ASK" => {
            let slot: u16 = parts.next()?.parse().ok()?;
            let (host, port) = parse_address(parts.next()?)?;
            Some(Redirect::Ask {
                slot: HashSlot::try_from(slot).ok()?,
                target: NodeId::new(host, port),
            })
        }
        "TRYAGAIN" => Some(Redirect::TryAgain),
        "CLUSTERDOWN" => Some(Redirect::ClusterDown),
        "MASTERDOWN" => Some(Redirect::MasterDown),
        "LOADING" => Some(Redirect::Loading),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test01_parses_moved() {
        let redirect = classify_error("MOVED 3999 127.0.0.1:7001").unwrap();
        assert_eq!(
            redirect,
            Redirect::Moved {
                slot: HashSlot::try_from(3999).unwrap(),
                target: NodeId::new("127.0.0.1", 7001),
            }
        );
    }

    #[test]
    fn test02_parses_ask() {
        let redirect = classify_error("ASK 3999 127.0.0.1:7002").unwrap();
        assert_eq!(
            redirect,
            Redirect::Ask {
                slot: HashSlot::try_from(3999).unwrap(),
                target: NodeId::new("127.0.0.1", 7002),
            }
        );
    }

    #[test]
    fn test03_unrelated_error_is_none() {
        assert_eq!(classify_error("WRONGTYPE operation against a key"), None);
    }

    #[test]
    fn test04_clusterdown() {
        assert_eq!(classify_error("CLUSTERDOWN hash slot not served"), Some(Redirect::ClusterDown));
    }

    #[test]
    fn test05_masterdown_and_loading() {
        assert_eq!(classify_error("MASTERDOWN Link with MASTER is down"), Some(Redirect::MasterDown));
        assert_eq!(classify_error("LOADING Redis is loading the dataset in memory"), Some(Redirect::Loading));
    }
}
