//! Reference profiles and their plain-text file formats.
//!
//! The master loads three optional files from its profile directory at
//! startup and ships the parsed maps to workers on request:
//!
//! - `<App>.txt` — app-wide remaining references per dataset, one
//!   `DATASETID:REFCOUNT` per line.
//! - `<App>-JobDAG.txt` — per-job reference maps, one
//!   `JOBID-DATASETID:REF[;DATASETID:REF]*` per line (the section after the
//!   `-` may be empty).
//! - `<App>-Peers.txt` — co-dependent dataset pairs, one
//!   `DATASETID:DATASETID` per line; both directions are registered.
//!
//! `<App>` is the configured application name with spaces stripped. Absent
//! files degrade to empty maps.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::block::{DatasetId, JobId};

/// Reuse-interval histogram of one dataset: interval length to frequency.
pub type ReuseHistogram = BTreeMap<u64, u64>;

/// Per-dataset reuse-interval histograms shipped with a job DAG broadcast.
pub type DagInfo = HashMap<DatasetId, ReuseHistogram>;

/// The profile triple a worker fetches from the master at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileBundle {
    /// App-wide remaining references of each dataset.
    pub ref_profile: HashMap<DatasetId, i64>,
    /// Per-job reference maps, applied when the job starts.
    pub ref_profile_by_job: HashMap<JobId, HashMap<DatasetId, i64>>,
    /// Symmetric peering of co-dependent datasets.
    pub peer_profile: HashMap<DatasetId, DatasetId>,
}

/// Error describing the first malformed line of a profile file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed profile line {line_no}: {content:?}")]
pub struct ProfileParseError {
    pub line_no: usize,
    pub content: String,
}

/// File names derived from the application name (spaces stripped):
/// `(<App>.txt, <App>-JobDAG.txt, <App>-Peers.txt)`.
#[must_use]
pub fn profile_file_names(app_name: &str) -> (String, String, String) {
    let app: String = app_name.chars().filter(|c| !c.is_whitespace()).collect();
    (
        format!("{app}.txt"),
        format!("{app}-JobDAG.txt"),
        format!("{app}-Peers.txt"),
    )
}

fn bad_line(line_no: usize, content: &str) -> ProfileParseError {
    ProfileParseError {
        line_no,
        content: content.to_string(),
    }
}

/// Splits one `DATASETID:NUMBER` pair.
fn parse_pair(piece: &str, line_no: usize, line: &str) -> Result<(u64, i64), ProfileParseError> {
    let (left, right) = piece.split_once(':').ok_or_else(|| bad_line(line_no, line))?;
    let dataset = left
        .trim()
        .parse::<u64>()
        .map_err(|_| bad_line(line_no, line))?;
    let count = right
        .trim()
        .parse::<i64>()
        .map_err(|_| bad_line(line_no, line))?;
    Ok((dataset, count))
}

/// Parses the `<App>.txt` per-dataset reference file.
pub fn parse_ref_profile(text: &str) -> Result<HashMap<DatasetId, i64>, ProfileParseError> {
    let mut refs = HashMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (dataset, count) = parse_pair(line, idx + 1, line)?;
        refs.insert(dataset, count);
    }
    Ok(refs)
}

/// Parses the `<App>-JobDAG.txt` per-job reference file.
pub fn parse_job_dag(
    text: &str,
) -> Result<HashMap<JobId, HashMap<DatasetId, i64>>, ProfileParseError> {
    let mut jobs = HashMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let (job_part, rest) = line.split_once('-').ok_or_else(|| bad_line(line_no, line))?;
        let job = job_part
            .trim()
            .parse::<u64>()
            .map_err(|_| bad_line(line_no, line))?;

        let mut refs = HashMap::new();
        if !rest.is_empty() {
            for piece in rest.split(';') {
                let (dataset, count) = parse_pair(piece, line_no, line)?;
                refs.insert(dataset, count);
            }
        }
        jobs.insert(job, refs);
    }
    Ok(jobs)
}

/// Parses the `<App>-Peers.txt` pair file; each line registers both
/// directions.
pub fn parse_peers(text: &str) -> Result<HashMap<DatasetId, DatasetId>, ProfileParseError> {
    let mut peers = HashMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (a, b) = parse_pair(line, idx + 1, line)?;
        let b = u64::try_from(b).map_err(|_| bad_line(idx + 1, line))?;
        peers.insert(a, b);
        peers.insert(b, a);
    }
    Ok(peers)
}
