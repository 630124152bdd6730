//! Result types for traceroute output.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// A single probe outcome at a given TTL. Appended once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct TracerouteHop {
    /// Whether a reply was received for the probe.
    pub success: bool,
    /// The address that replied, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    /// The TTL the probe was sent with.
    pub ttl: u8,
    /// Round-trip time, serialized as milliseconds.
    #[serde(
        serialize_with = "serialize_rtt_ms",
        skip_serializing_if = "Option::is_none",
        rename = "rtt_ms"
    )]
    pub rtt: Option<Duration>,
}

fn serialize_rtt_ms<S: Serializer>(rtt: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
    match rtt {
        Some(rtt) => ser.serialize_f64(rtt.as_secs_f64() * 1000.0),
        None => ser.serialize_none(),
    }
}

impl fmt::Display for TracerouteHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.address, self.rtt) {
            (Some(address), Some(rtt)) => write!(f, "{} {:?}", address, rtt),
            (Some(address), None) => write!(f, "{}", address),
            _ => write!(f, "*"),
        }
    }
}

/// Per-run result: TTL to the probes recorded at that TTL, in completion
/// order.
pub type ResultTable = BTreeMap<u8, Vec<TracerouteHop>>;

/// Trims the result table after the destination has been recorded: once a TTL
/// bucket contains a hop whose address equals the destination, every higher
/// TTL is dropped.
pub fn reduce_final_result(mut table: ResultTable, destination: IpAddr) -> ResultTable {
    let final_ttl = table
        .iter()
        .filter(|(_, hops)| hops.iter().any(|hop| hop.address == Some(destination)))
        .map(|(ttl, _)| *ttl)
        .min();

    if let Some(final_ttl) = final_ttl {
        table.retain(|ttl, _| *ttl <= final_ttl);
    }
    table
}
