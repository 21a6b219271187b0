//! The consistent-hash ring

use md5::{Digest, Md5};

/// Ring points contributed by each physical node
pub const VIRTUAL_NODES: u32 = 150;

/// Consistent-hash ring with virtual nodes
///
/// Each node contributes [`VIRTUAL_NODES`] points at
/// `u32_be(MD5(node_id ++ char(i))[0..4])`. A key is routed by hashing it
/// the same way (with index 0) and walking the ring clockwise, collecting
/// the first n distinct owners. The walk order is the canonical replica
/// order for the key and is stable across lookups.
pub struct HashRing {
    nodes: Vec<String>,
    /// Sorted ring points
    ring: Vec<u32>,
    /// Owner of each ring point, parallel to `ring`, as an index into `nodes`
    owners: Vec<usize>,
}

impl HashRing {
    /// Build a ring over the given node identifiers
    #[must_use]
    pub fn new(nodes: Vec<String>) -> Self {
        let mut points: Vec<(u32, usize)> = Vec::with_capacity(nodes.len() * VIRTUAL_NODES as usize);
        for (owner, node) in nodes.iter().enumerate() {
            for i in 0..VIRTUAL_NODES {
                points.push((hash_point(node, i), owner));
            }
        }
        points.sort_unstable();

        let (ring, owners) = points.into_iter().unzip();
        Self {
            nodes,
            ring,
            owners,
        }
    }

    /// Number of physical nodes on the ring
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in configuration order
    #[must_use]
    pub fn all_nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Return up to `n` distinct nodes for the key, in replica order
    #[must_use]
    pub fn get_nodes(&self, key: &str, n: usize) -> Vec<&str> {
        if self.nodes.is_empty() || n == 0 {
            return Vec::new();
        }
        let n = n.min(self.nodes.len());

        let hash = hash_point(key, 0);
        let start = match self.ring.partition_point(|&p| p < hash) {
            idx if idx >= self.ring.len() => 0,
            idx => idx,
        };

        let mut seen = vec![false; self.nodes.len()];
        let mut result = Vec::with_capacity(n);
        for i in 0..self.ring.len() {
            let owner = self.owners[(start + i) % self.ring.len()];
            if !seen[owner] {
                seen[owner] = true;
                result.push(self.nodes[owner].as_str());
                if result.len() == n {
                    break;
                }
            }
        }
        result
    }
}

/// Ring point for `id` at virtual index `index`
///
/// The suffix is the UTF-8 encoding of the code point `index`, and the
/// point is the big-endian u32 of the first four MD5 bytes. Key lookups
/// use index 0.
fn hash_point(id: &str, index: u32) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(id.as_bytes());
    let c = char::from_u32(index).expect("virtual node index is a valid code point");
    let mut buf = [0u8; 4];
    hasher.update(c.encode_utf8(&mut buf).as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn three_nodes() -> HashRing {
        HashRing::new(vec![
            "http://node1:8080".to_string(),
            "http://node2:8080".to_string(),
            "http://node3:8080".to_string(),
        ])
    }

    #[test]
    fn test_get_nodes_distinct() {
        let ring = three_nodes();
        for i in 0..100 {
            let nodes = ring.get_nodes(&format!("bucket/key-{i}"), 3);
            assert_eq!(nodes.len(), 3);
            let mut unique = nodes.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(unique.len(), 3, "replica set contains duplicates");
        }
    }

    #[test]
    fn test_get_nodes_deterministic() {
        let ring = three_nodes();
        let other = three_nodes();
        for i in 0..100 {
            let key = format!("bucket/key-{i}");
            assert_eq!(ring.get_nodes(&key, 2), ring.get_nodes(&key, 2));
            assert_eq!(ring.get_nodes(&key, 2), other.get_nodes(&key, 2));
        }
    }

    #[test]
    fn test_get_nodes_caps_at_node_count() {
        let ring = three_nodes();
        let nodes = ring.get_nodes("bucket/key", 10);
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(Vec::new());
        assert!(ring.get_nodes("bucket/key", 3).is_empty());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_balance_within_twenty_percent_of_uniform() {
        let ring = three_nodes();
        let mut counts: HashMap<String, usize> = HashMap::new();
        const KEYS: usize = 1000;
        for i in 0..KEYS {
            let nodes = ring.get_nodes(&format!("bucket/object-{i}"), 1);
            *counts.entry(nodes[0].to_string()).or_default() += 1;
        }

        // Each node should take 33% +/- 20 points of the primary load
        for (node, count) in &counts {
            let share = *count as f64 / KEYS as f64;
            assert!(
                (0.20..=0.46).contains(&share),
                "node {node} holds {share:.2} of the load"
            );
        }
    }

    #[test]
    fn test_replica_order_is_stable_prefix() {
        // The first element of get_nodes(key, 1) must equal the first of
        // get_nodes(key, 3): the walk order is canonical.
        let ring = three_nodes();
        for i in 0..50 {
            let key = format!("b/k{i}");
            let one = ring.get_nodes(&key, 1);
            let three = ring.get_nodes(&key, 3);
            assert_eq!(one[0], three[0]);
        }
    }
}
