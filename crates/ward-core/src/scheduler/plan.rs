use std::collections::BTreeSet;

use super::graph::DependencyGraph;

/// Admission bookkeeping for one scheduling run, independent of any
/// runtime: which nodes are still waiting, which are in flight, and which
/// may start next.
#[derive(Debug, Clone)]
pub struct AdmissionPlan {
    graph: DependencyGraph,
    remaining: BTreeSet<String>,
    in_flight: BTreeSet<String>,
    max_concurrency: usize,
}

impl AdmissionPlan {
    /// Every node in `graph` starts out remaining. A concurrency of zero is
    /// treated as one.
    pub fn new(graph: DependencyGraph, max_concurrency: usize) -> Self {
        let remaining = graph.nodes().cloned().collect();
        Self {
            graph,
            remaining,
            in_flight: BTreeSet::new(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn remaining(&self) -> &BTreeSet<String> {
        &self.remaining
    }

    pub fn in_flight(&self) -> &BTreeSet<String> {
        &self.in_flight
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty() && self.in_flight.is_empty()
    }

    /// Union of the covers of every in-flight node.
    pub fn current_cover(&self) -> BTreeSet<String> {
        self.in_flight
            .iter()
            .filter_map(|n| self.graph.cover(n))
            .flatten()
            .cloned()
            .collect()
    }

    /// Admit as many remaining nodes as the concurrency limit and the
    /// current cover allow, smallest cover first. Admitted nodes move to
    /// in-flight and are returned in admission order.
    pub fn admit(&mut self) -> Vec<String> {
        let mut cover = self.current_cover();
        let mut admitted = Vec::new();
        for node in self.graph.admission_order(&self.remaining) {
            if self.in_flight.len() >= self.max_concurrency {
                break;
            }
            if cover.contains(&node) {
                continue;
            }
            if let Some(c) = self.graph.cover(&node) {
                cover.extend(c.iter().cloned());
            }
            self.remaining.remove(&node);
            self.in_flight.insert(node.clone());
            admitted.push(node);
        }
        admitted
    }

    /// Mark an in-flight node as finished. Returns false if it was not in
    /// flight.
    pub fn settle(&mut self, node: &str) -> bool {
        self.in_flight.remove(node)
    }

    /// Admission waves assuming every admitted node finishes before the
    /// next tick.
    pub fn simulate_waves(mut self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        loop {
            let wave = self.admit();
            if wave.is_empty() {
                break;
            }
            for node in &wave {
                self.settle(node);
            }
            waves.push(wave);
        }
        waves
    }
}
