//! Optimal steady-state lease assignment.
//!
//! Given per-dataset reuse-interval histograms and a total cost budget, the
//! engine assigns each dataset the lease length that maximises cache hits:
//! repeatedly extend whichever dataset's lease buys the most additional hits
//! per unit of additional cost (PPUC), until the budget would be exceeded or
//! no extension helps. Candidate lease lengths are exactly the histogram's
//! interval keys; a lease never exceeds the dataset's largest observed
//! reuse interval.

use std::collections::HashMap;

use tracing::debug;

use blockgrid_core::{DagInfo, DatasetId, ReuseHistogram};

/// Cache hits a dataset yields under the given lease: every reuse whose
/// interval fits inside the lease.
fn hits(histogram: &ReuseHistogram, lease: u64) -> u64 {
    histogram
        .range(..=lease)
        .map(|(_, freq)| freq)
        .sum()
}

/// Cache-space cost of holding a dataset for the given lease: reuses inside
/// the lease cost their interval, reuses beyond it cost the full lease.
fn cost(histogram: &ReuseHistogram, lease: u64) -> u64 {
    let inside: u64 = histogram
        .range(..=lease)
        .map(|(interval, freq)| interval * freq)
        .sum();
    let beyond: u64 = histogram
        .range(lease + 1..)
        .map(|(_, freq)| lease * freq)
        .sum();
    inside + beyond
}

/// Computes the lease assignment for the given histograms.
///
/// `avg_cache_size` scales the budget: the planning target is
/// `avg_cache_size * access_number_global` total cost. Ties on PPUC go to
/// the first candidate seen (datasets in ascending id order, lease lengths
/// ascending within a dataset).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_lease_map(
    dag: &DagInfo,
    avg_cache_size: u64,
    access_number_global: u64,
) -> HashMap<DatasetId, i64> {
    let target = avg_cache_size.saturating_mul(access_number_global);

    let mut datasets: Vec<DatasetId> = dag.keys().copied().collect();
    datasets.sort_unstable();

    let mut leases: HashMap<DatasetId, u64> =
        datasets.iter().map(|&d| (d, 0)).collect();
    let mut spent: u64 = 0;

    loop {
        let mut best: Option<(DatasetId, u64, f64, u64)> = None;
        for &dataset in &datasets {
            let histogram = &dag[&dataset];
            let assigned = leases[&dataset];
            let base_hits = hits(histogram, assigned);
            let base_cost = cost(histogram, assigned);

            for &candidate in histogram.keys() {
                if candidate <= assigned {
                    continue;
                }
                let delta_hits = hits(histogram, candidate) - base_hits;
                let delta_cost = cost(histogram, candidate) - base_cost;
                let ppuc = if delta_cost == 0 {
                    0.0
                } else {
                    delta_hits as f64 / delta_cost as f64
                };
                if ppuc > 0.0 && best.is_none_or(|(_, _, best_ppuc, _)| ppuc > best_ppuc) {
                    best = Some((dataset, candidate, ppuc, delta_cost));
                }
            }
        }

        let Some((dataset, lease, _, delta_cost)) = best else {
            break;
        };
        if spent.saturating_add(delta_cost) > target {
            break;
        }
        leases.insert(dataset, lease);
        spent += delta_cost;
    }

    debug!(datasets = leases.len(), spent, target, "computed lease assignment");
    leases
        .into_iter()
        .map(|(d, lease)| (d, i64::try_from(lease).unwrap_or(i64::MAX)))
        .collect()
}
