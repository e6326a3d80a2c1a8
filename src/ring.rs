//! Consistent-hash placement of collection paths onto nodes.
//!
//! Every node contributes a fixed number of points to the ring, each point
//! being a hash of `"<node>:<replica>"`, so the layout is a pure function
//! of the node-name set: any two nodes that agree on membership agree on
//! placement, regardless of the order names were learned in. Requests key
//! the ring by the collection path; the first node at or after the key's
//! hash is the primary, and walking onward yields the backups, then the
//! node that picks up transfers during membership changes.

use sha2::{Digest, Sha256};

const POINTS_PER_NODE: usize = 64;

/// A consistent-hash ring over a set of node names.
#[derive(Clone, Debug)]
pub struct HashRing {
    nodes: Vec<String>,
    points: Vec<(u64, usize)>,
}

impl HashRing {
    /// Builds the ring for the given node names; duplicates collapse and
    /// ordering does not matter.
    pub fn new<I, S>(names: I) -> HashRing
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: Vec<String> = names.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();

        let mut points = Vec::with_capacity(nodes.len() * POINTS_PER_NODE);
        for (index, node) in nodes.iter().enumerate() {
            for replica in 0..POINTS_PER_NODE {
                points.push((hash(format!("{node}:{replica}").as_bytes()), index));
            }
        }
        points.sort_unstable();

        HashRing { nodes, points }
    }

    /// The member names, sorted.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n == name)
    }

    /// The ring extended with `name`.
    pub fn with_node(&self, name: &str) -> HashRing {
        HashRing::new(self.nodes.iter().map(String::as_str).chain([name]))
    }

    /// The ring without `name`.
    pub fn without_node(&self, name: &str) -> HashRing {
        HashRing::new(self.nodes.iter().filter(|n| *n != name).map(String::as_str))
    }

    /// The primary node for `key`, or `None` on an empty ring.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        self.iterate_nodes(key).next()
    }

    /// Every distinct node starting at `key`'s primary, in ring order.
    ///
    /// Callers take the next K entries as the backup set, and the one
    /// after that as the transfer target during membership changes.
    pub fn iterate_nodes(&self, key: &str) -> impl Iterator<Item = &str> {
        let mut order = Vec::with_capacity(self.nodes.len());
        if !self.points.is_empty() {
            let target = hash(key.as_bytes());
            let start = self.points.partition_point(|(point, _)| *point < target);
            let mut seen = vec![false; self.nodes.len()];
            for offset in 0..self.points.len() {
                let (_, index) = self.points[(start + offset) % self.points.len()];
                if !seen[index] {
                    seen[index] = true;
                    order.push(self.nodes[index].as_str());
                    if order.len() == self.nodes.len() {
                        break;
                    }
                }
            }
        }
        order.into_iter()
    }
}

fn hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
