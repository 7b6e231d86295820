//! Density-based clustering over small row-major point sets.
//!
//! A point is a core point when at least `min_samples` points (itself
//! included) lie within `epsilon` of it, measured by Euclidean distance.
//! Clusters grow from core points in input order, so labels are deterministic.
//! Neighbourhoods are recomputed on demand instead of materialising a distance
//! matrix, keeping memory linear in the number of points.

use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DbscanParams {
    pub epsilon: f64,
    pub min_samples: usize,
}

fn distance_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn region_query(points: &[Vec<f64>], idx: usize, eps_sq: f64) -> Vec<usize> {
    points
        .iter()
        .enumerate()
        .filter(|(_, other)| distance_sq(&points[idx], other) <= eps_sq)
        .map(|(j, _)| j)
        .collect()
}

/// Points waiting to be expanded. Each point is queued at most once over the
/// whole run, so the queue never outgrows the point set.
struct Frontier {
    queue: VecDeque<usize>,
    queued: Vec<bool>,
    pushed: usize,
}

impl Frontier {
    fn new(n: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: vec![false; n],
            pushed: 0,
        }
    }

    fn push(&mut self, idx: usize) {
        if !self.queued[idx] {
            self.queued[idx] = true;
            self.queue.push_back(idx);
            self.pushed += 1;
        }
    }

    fn pop(&mut self) -> Option<usize> {
        self.queue.pop_front()
    }
}

/// Cluster label per point; `None` marks noise.
pub(crate) fn dbscan(points: &[Vec<f64>], params: DbscanParams) -> Vec<Option<usize>> {
    label_points(points, params).0
}

fn label_points(points: &[Vec<f64>], params: DbscanParams) -> (Vec<Option<usize>>, Frontier) {
    let n = points.len();
    let eps_sq = params.epsilon * params.epsilon;
    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut frontier = Frontier::new(n);
    let mut next_cluster = 0;

    for start in 0..n {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let neighbours = region_query(points, start, eps_sq);
        if neighbours.len() < params.min_samples {
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[start] = Some(cluster);
        frontier.push(start);
        for idx in neighbours {
            frontier.push(idx);
        }
        while let Some(idx) = frontier.pop() {
            if labels[idx].is_none() {
                labels[idx] = Some(cluster);
            }
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            let expansion = region_query(points, idx, eps_sq);
            if expansion.len() >= params.min_samples {
                for j in expansion {
                    frontier.push(j);
                }
            }
        }
    }
    tracing::trace!(points = n, clusters = next_cluster, queued = frontier.pushed, "dbscan labelled points");
    (labels, frontier)
}
