//! Monthly clustering pass.
//!
//! Density-based clustering over the live embeddings, DBSCAN-style with
//! cosine distance. The neighborhood radius is re-tuned every pass so the
//! median neighborhood size lands near the configured target. Cluster ids
//! are stable across passes when enough members carry over; otherwise a
//! fresh id is minted and the old cluster is marked superseded.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ctx::OpCtx;
use crate::embeddings::{cosine_similarity, l2_normalize};
use crate::error::Result;
use crate::memory::Cluster;
use crate::storage::{Filter, Store};

/// Most points fed into one clustering pass. Larger stores cluster their
/// most recently updated slice; the drop is logged.
const POINT_CAP: usize = 2_048;

/// Member overlap ratio required to keep a prior cluster's id.
const STABLE_OVERLAP: f64 = 0.6;

/// Pages scanned per batch.
const SCAN_PAGE: usize = 500;

struct Point {
    row_id: i64,
    hash: String,
    vector: Vec<f32>,
}

pub(crate) fn run(
    store: &Store,
    now: DateTime<Utc>,
    ctx: &OpCtx,
) -> Result<BTreeMap<String, i64>> {
    let min_size = store.config().cluster_min_size;
    let target = store.config().cluster_target_neighborhood;

    // Scanning: live rows and their vectors.
    let mut points: Vec<Point> = Vec::new();
    let mut dropped = 0usize;
    for page in store.scan(Filter::default(), SCAN_PAGE) {
        ctx.check()?;
        for memory in page? {
            if points.len() >= POINT_CAP {
                dropped += 1;
                continue;
            }
            let index = store.index()?;
            if let Some(vector) = index.get(memory.row_id) {
                points.push(Point {
                    row_id: memory.row_id,
                    hash: memory.content_hash.clone(),
                    vector: vector.to_vec(),
                });
            }
        }
    }
    if dropped > 0 {
        tracing::warn!(dropped, cap = POINT_CAP, "clustering input capped");
    }

    let mut counts = BTreeMap::new();
    counts.insert("points".to_string(), points.len() as i64);
    if points.len() < min_size {
        counts.insert("clusters".to_string(), 0);
        counts.insert("noise".to_string(), points.len() as i64);
        return Ok(counts);
    }

    // Computing: sorted per-point distance lists, epsilon tuning, DBSCAN.
    ctx.check()?;
    let sorted_dists = pairwise_sorted_distances(&points);
    let epsilon = tune_epsilon(&sorted_dists, target);
    let assignments = dbscan(&sorted_dists, epsilon, min_size);

    let mut member_sets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, assignment) in assignments.iter().enumerate() {
        if let Some(cluster) = assignment {
            member_sets.entry(*cluster).or_default().push(idx);
        }
    }
    member_sets.retain(|_, members| members.len() >= min_size);
    let noise = assignments.iter().filter(|a| a.is_none()).count()
        + assignments
            .iter()
            .filter(|a| a.is_some_and(|c| !member_sets.contains_key(&c)))
            .count();

    // Stable-id matching against the previous generation.
    ctx.check()?;
    let prior = store.live_clusters()?;
    let mut claimed: HashSet<String> = HashSet::new();
    let mut new_clusters: Vec<Cluster> = Vec::new();
    let mut reused = 0i64;

    for members in member_sets.values() {
        let hashes: Vec<String> = {
            let mut h: Vec<String> =
                members.iter().map(|&i| points[i].hash.clone()).collect();
            h.sort();
            h
        };
        let hash_set: HashSet<&String> = hashes.iter().collect();

        // Best unclaimed prior cluster by overlap with the new membership.
        let mut best: Option<(&Cluster, f64)> = None;
        for (old, _) in &prior {
            if claimed.contains(&old.cluster_id) {
                continue;
            }
            let overlap = old.members.iter().filter(|m| hash_set.contains(m)).count();
            let ratio = overlap as f64 / hashes.len() as f64;
            if ratio >= STABLE_OVERLAP && best.is_none_or(|(_, r)| ratio > r) {
                best = Some((old, ratio));
            }
        }

        let mut centroid = vec![0.0f32; store.config().vector_dimension];
        for &i in members {
            for (c, x) in centroid.iter_mut().zip(points[i].vector.iter()) {
                *c += x;
            }
        }
        let n = members.len() as f32;
        for c in centroid.iter_mut() {
            *c /= n;
        }
        l2_normalize(&mut centroid);

        let (cluster_id, created_at) = match best {
            Some((old, _)) => {
                claimed.insert(old.cluster_id.clone());
                reused += 1;
                (old.cluster_id.clone(), old.created_at)
            }
            None => (Uuid::new_v4().to_string(), now),
        };

        new_clusters.push(Cluster {
            cluster_id,
            members: hashes,
            centroid,
            created_at,
            last_rebuilt_at: now,
            superseded: false,
        });
    }

    let superseded: Vec<String> = prior
        .iter()
        .filter(|(old, _)| !claimed.contains(&old.cluster_id))
        .map(|(old, _)| old.cluster_id.clone())
        .collect();

    // Writing: one transaction for the generation swap.
    store.apply_clusters(&new_clusters, &superseded, ctx)?;

    counts.insert("clusters".to_string(), new_clusters.len() as i64);
    counts.insert("noise".to_string(), noise as i64);
    counts.insert("reused_ids".to_string(), reused);
    counts.insert(
        "minted_ids".to_string(),
        new_clusters.len() as i64 - reused,
    );
    counts.insert("superseded".to_string(), superseded.len() as i64);
    counts.insert("epsilon_micro".to_string(), (epsilon * 1e6) as i64);
    Ok(counts)
}

/// For each point, every other point sorted by ascending cosine distance.
fn pairwise_sorted_distances(points: &[Point]) -> Vec<Vec<(f32, usize)>> {
    let n = points.len();
    let mut rows: Vec<Vec<(f32, usize)>> = Vec::with_capacity(n);
    for i in 0..n {
        let mut row: Vec<(f32, usize)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| {
                (
                    1.0 - cosine_similarity(&points[i].vector, &points[j].vector),
                    j,
                )
            })
            .collect();
        row.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        rows.push(row);
    }
    rows
}

/// Neighbors of a point within epsilon, via its sorted distance row.
fn neighbors_within(row: &[(f32, usize)], epsilon: f32) -> usize {
    row.partition_point(|(d, _)| *d <= epsilon)
}

/// Binary-search epsilon so the median neighborhood size lands at the
/// target. Distances are in [0, 2] for cosine.
fn tune_epsilon(sorted_dists: &[Vec<(f32, usize)>], target: usize) -> f32 {
    let mut lo = 0.0f32;
    let mut hi = 1.0f32;
    for _ in 0..24 {
        let mid = (lo + hi) / 2.0;
        let mut sizes: Vec<usize> = sorted_dists
            .iter()
            .map(|row| neighbors_within(row, mid))
            .collect();
        sizes.sort_unstable();
        let median = sizes[sizes.len() / 2];
        if median < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

/// Classic DBSCAN over precomputed neighbor lists. Returns the cluster
/// assignment per point; `None` is noise.
fn dbscan(
    sorted_dists: &[Vec<(f32, usize)>],
    epsilon: f32,
    min_size: usize,
) -> Vec<Option<usize>> {
    let n = sorted_dists.len();
    let neighbor_lists: Vec<Vec<usize>> = sorted_dists
        .iter()
        .map(|row| {
            let k = neighbors_within(row, epsilon);
            row[..k].iter().map(|(_, j)| *j).collect()
        })
        .collect();
    // A point counts itself toward the density threshold.
    let is_core: Vec<bool> = neighbor_lists
        .iter()
        .map(|nb| nb.len() + 1 >= min_size)
        .collect();

    let mut assignment: Vec<Option<usize>> = vec![None; n];
    let mut next_cluster = 0usize;

    for start in 0..n {
        if assignment[start].is_some() || !is_core[start] {
            continue;
        }
        let cluster = next_cluster;
        next_cluster += 1;

        let mut queue: VecDeque<usize> = VecDeque::new();
        assignment[start] = Some(cluster);
        queue.push_back(start);
        while let Some(p) = queue.pop_front() {
            for &q in &neighbor_lists[p] {
                if assignment[q].is_none() {
                    assignment[q] = Some(cluster);
                    // Only core points keep expanding the frontier.
                    if is_core[q] {
                        queue.push_back(q);
                    }
                }
            }
        }
    }
    assignment
}
