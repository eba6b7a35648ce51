use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Error};
use serde::{Deserialize, Deserializer, Serialize};

/// Role a node plays in the transfer topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Source,
    Destination,
    Dtn,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct PowerRange {
    pub min: f64,
    pub max: f64,
}

impl PowerRange {
    pub fn mean(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

/// NIC speed parsed from human strings such as "1Gbps" or "400Mbps".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NicSpeed {
    pub bps: u64,
}

impl FromStr for NicSpeed {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        if !upper.ends_with("BPS") {
            return Err(anyhow!("NIC speed {:?} must end with \"bps\"", s));
        }
        let prefix = &upper[..upper.len() - 3];
        let (value, multiplier) = if let Some(v) = prefix.strip_suffix('G') {
            (v, 1_000_000_000u64)
        } else if let Some(v) = prefix.strip_suffix('M') {
            (v, 1_000_000)
        } else if let Some(v) = prefix.strip_suffix('K') {
            (v, 1_000)
        } else {
            (prefix, 1)
        };
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("NIC speed {:?} has no numeric value", s))?;
        if value <= 0.0 {
            return Err(anyhow!("NIC speed {:?} must be positive", s));
        }
        Ok(NicSpeed {
            bps: (value * multiplier as f64) as u64,
        })
    }
}

impl fmt::Display for NicSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.bps)
    }
}

impl<'de> Deserialize<'de> for NicSpeed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A transfer endpoint or data-transfer node, as described in `nodes.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeType,
    #[serde(rename = "CPU")]
    pub cpu_cores: u32,
    #[serde(rename = "total_ram")]
    pub total_ram: f64,
    #[serde(rename = "NIC_SPEED")]
    pub nic_speed: NicSpeed,
    pub gf: f64,
    pub power: PowerRange,
}

/// All nodes keyed by name, with the single destination resolved up front.
#[derive(Clone, Debug)]
pub struct NodeMap {
    nodes: HashMap<String, Node>,
    destination: String,
}

impl NodeMap {
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self, Error> {
        let destinations: Vec<&str> = nodes
            .iter()
            .filter(|n| n.kind == NodeType::Destination)
            .map(|n| n.name.as_str())
            .collect();
        if destinations.len() != 1 {
            return Err(anyhow!(
                "expected exactly one destination node, found {}: {:?}",
                destinations.len(),
                destinations
            ));
        }
        let destination = destinations[0].to_string();
        let mut map = HashMap::new();
        for node in nodes {
            if map.insert(node.name.clone(), node).is_some() {
                return Err(anyhow!("duplicate node name in nodes file"));
            }
        }
        Ok(NodeMap {
            nodes: map,
            destination,
        })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .with_context(|| format!("failed to open nodes file {}", path.display()))?;
        let nodes: Vec<Node> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse nodes file {}", path.display()))?;
        let map = Self::from_nodes(nodes)?;
        tracing::info!(nodes = map.nodes.len(), "loaded nodes");
        Ok(map)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_source(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .map(|n| n.kind == NodeType::Source)
            .unwrap_or(false)
    }

    pub fn is_destination(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .map(|n| n.kind == NodeType::Destination)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
