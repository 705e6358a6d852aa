//! Startup loading of the reference profile files.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use tracing::info;

use blockgrid_core::{
    parse_job_dag, parse_peers, parse_ref_profile, profile_file_names, ProfileBundle,
};

fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Loads the three profile files from `dir`, treating absent files as empty
/// maps. A present-but-malformed file is a startup error.
pub fn load_profiles(dir: &Path, app_name: &str) -> anyhow::Result<ProfileBundle> {
    let (refs_name, dag_name, peers_name) = profile_file_names(app_name);

    let mut bundle = ProfileBundle::default();

    let refs_path = dir.join(&refs_name);
    if let Some(text) = read_optional(&refs_path)? {
        bundle.ref_profile =
            parse_ref_profile(&text).with_context(|| format!("parsing {}", refs_path.display()))?;
    }

    let dag_path = dir.join(&dag_name);
    if let Some(text) = read_optional(&dag_path)? {
        bundle.ref_profile_by_job =
            parse_job_dag(&text).with_context(|| format!("parsing {}", dag_path.display()))?;
    }

    let peers_path = dir.join(&peers_name);
    if let Some(text) = read_optional(&peers_path)? {
        bundle.peer_profile =
            parse_peers(&text).with_context(|| format!("parsing {}", peers_path.display()))?;
    }

    info!(
        app_name,
        datasets = bundle.ref_profile.len(),
        jobs = bundle.ref_profile_by_job.len(),
        peers = bundle.peer_profile.len(),
        "loaded reference profiles"
    );
    Ok(bundle)
}
