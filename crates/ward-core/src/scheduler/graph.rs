use std::collections::{BTreeMap, BTreeSet};

use crate::collaborators::ShardReplicas;

/// For each candidate node, the nodes that must not be acted on at the
/// same time: itself plus every node it shares a shard replica set with.
///
/// Covers are symmetric between candidates and always reflexive. They are
/// computed once per scheduling run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    covers: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build covers for `nodes` from the replica set of every shard.
    pub fn from_replica_sets<S: AsRef<[String]>>(nodes: &[String], replica_sets: &[S]) -> Self {
        let mut covers: BTreeMap<String, BTreeSet<String>> = nodes
            .iter()
            .map(|n| (n.clone(), BTreeSet::from([n.clone()])))
            .collect();
        for set in replica_sets {
            let set = set.as_ref();
            for replica in set {
                if let Some(cover) = covers.get_mut(replica) {
                    cover.extend(set.iter().cloned());
                }
            }
        }
        Self { covers }
    }

    pub fn from_shards(nodes: &[String], shards: &[ShardReplicas]) -> Self {
        let sets: Vec<&[String]> = shards.iter().map(|s| s.replicas.as_slice()).collect();
        Self::from_replica_sets(nodes, &sets)
    }

    pub fn cover(&self, node: &str) -> Option<&BTreeSet<String>> {
        self.covers.get(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> {
        self.covers.keys()
    }

    pub fn len(&self) -> usize {
        self.covers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.covers.is_empty()
    }

    /// True when `a` and `b` hold replicas of a common shard.
    pub fn linked(&self, a: &str, b: &str) -> bool {
        self.cover(a).is_some_and(|c| c.contains(b))
    }

    /// `remaining` sorted by ascending cover size, ties broken by id.
    pub fn admission_order(&self, remaining: &BTreeSet<String>) -> Vec<String> {
        let mut order: Vec<&String> = remaining.iter().collect();
        // BTreeSet iteration is already lexical; a stable sort keeps it as
        // the tie-break.
        order.sort_by_key(|n| self.cover(n).map_or(1, BTreeSet::len));
        order.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn six_node_graph() -> DependencyGraph {
        DependencyGraph::from_replica_sets(
            &ids(&["0", "1", "2", "3", "4", "5"]),
            &[ids(&["0", "1", "3"]), ids(&["1", "2", "4"]), ids(&["3", "4", "5"])],
        )
    }

    #[test]
    fn covers_are_reflexive_and_symmetric() {
        let g = six_node_graph();
        for a in g.nodes() {
            assert!(g.linked(a, a));
            for b in g.nodes() {
                assert_eq!(g.linked(a, b), g.linked(b, a), "{a} <-> {b}");
            }
        }
        assert_eq!(g.cover("0").unwrap(), &BTreeSet::from(["0", "1", "3"].map(String::from)));
        assert_eq!(g.cover("1").unwrap().len(), 5);
        assert!(!g.linked("0", "2"));
        assert!(!g.linked("2", "5"));
    }

    #[test]
    fn isolated_nodes_cover_only_themselves() {
        let g = DependencyGraph::from_replica_sets::<Vec<String>>(&ids(&["a", "b"]), &[]);
        assert_eq!(g.cover("a").unwrap().len(), 1);
        assert!(!g.linked("a", "b"));
    }

    #[test]
    fn replicas_outside_the_batch_still_count_in_covers() {
        let g = DependencyGraph::from_replica_sets(&ids(&["a"]), &[ids(&["a", "z"])]);
        assert!(g.cover("a").unwrap().contains("z"));
        assert!(g.cover("z").is_none());
    }

    #[test]
    fn admission_order_is_smallest_cover_then_lexical() {
        let g = six_node_graph();
        let remaining: BTreeSet<String> = g.nodes().cloned().collect();
        assert_eq!(g.admission_order(&remaining), ids(&["0", "2", "5", "1", "3", "4"]));
    }
}
