//! Kubeconfig discovery
//!
//! Clusters come from kubeconfig contexts, merged from three sources in
//! order: the default `~/.kube/config`, the `KUBECONFIG` environment
//! variable, and paths or glob patterns from the config file. Files are
//! deduplicated by path; context names become cluster names and must be
//! unique across all sources.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use kube::config::Kubeconfig;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Per-cluster settings derived from one kubeconfig context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCluster {
    /// Cluster name; equals the context name.
    pub name: String,
    /// Kubeconfig file the context came from.
    pub kubeconfig: PathBuf,
    /// Context name inside that file.
    pub context: String,
    /// The context's namespace, or `default` when unset.
    pub namespace: String,
}

/// Discover clusters from all configured kubeconfig sources.
pub fn resolve_kubeconfigs(config: &Config) -> Result<Vec<ResolvedCluster>> {
    let mut seen = HashSet::new();
    let mut clusters = Vec::new();

    // phase 1: default kubeconfig
    if config.skip_default_kubeconfig {
        info!("skipping default kubeconfig");
    } else {
        let default_path = default_kubeconfig_path();
        if default_path.exists() {
            clusters.extend(load_kubeconfig_file(&default_path, "default", &mut seen)?);
        } else {
            info!(path = %default_path.display(), "default kubeconfig not found");
        }
    }

    // phase 2: KUBECONFIG environment variable
    if config.skip_kubeconfig_env {
        info!("skipping KUBECONFIG environment variable");
    } else {
        match std::env::var("KUBECONFIG") {
            Ok(value) if !value.trim().is_empty() => {
                for path in std::env::split_paths(&value) {
                    let path = expand_tilde(&path.to_string_lossy());
                    clusters.extend(load_kubeconfig_file(&path, "KUBECONFIG env", &mut seen)?);
                }
            }
            _ => info!("KUBECONFIG environment variable is not set"),
        }
    }

    // phase 3: explicit paths and globs from config
    for pattern in &config.kubeconfigs {
        let pattern = expand_tilde(pattern);
        let is_glob = is_glob_pattern(&pattern.to_string_lossy());
        let source = if is_glob { "config glob" } else { "config" };

        for path in expand_glob_pattern(&pattern)? {
            clusters.extend(load_kubeconfig_file(&path, source, &mut seen)?);
        }
    }

    if clusters.is_empty() {
        warn!("no kubeconfig files matched any configured source");
    }

    Ok(clusters)
}

/// Check that the resolved clusters are well-formed: non-empty dot-free
/// names, unique across all sources.
pub fn validate_clusters(clusters: &[ResolvedCluster]) -> Result<()> {
    if clusters.is_empty() {
        bail!("at least one cluster is required");
    }

    let mut names = HashSet::new();

    for cluster in clusters {
        if cluster.name.is_empty() {
            bail!(
                "kubeconfig {} has a context with an empty name",
                cluster.kubeconfig.display()
            );
        }

        // the cluster name is a hostname label, so dots would break parsing
        if cluster.name.contains('.') {
            bail!("cluster name {:?} must not contain dots", cluster.name);
        }

        if !names.insert(cluster.name.as_str()) {
            bail!("duplicate cluster name {:?}", cluster.name);
        }
    }

    Ok(())
}

/// Load one kubeconfig file; already-seen paths are skipped entirely.
fn load_kubeconfig_file(
    path: &Path,
    source: &str,
    seen: &mut HashSet<PathBuf>,
) -> Result<Vec<ResolvedCluster>> {
    if !seen.insert(path.to_path_buf()) {
        debug!(path = %path.display(), source, "skipping already loaded kubeconfig");
        return Ok(Vec::new());
    }

    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("loading kubeconfig {}", path.display()))?;

    let mut clusters = Vec::new();
    let mut context_names = Vec::new();

    for named in &kubeconfig.contexts {
        let namespace = named
            .context
            .as_ref()
            .and_then(|c| c.namespace.clone())
            .unwrap_or_else(|| "default".to_string());

        clusters.push(ResolvedCluster {
            name: named.name.clone(),
            kubeconfig: path.to_path_buf(),
            context: named.name.clone(),
            namespace,
        });

        context_names.push(named.name.clone());
    }

    context_names.sort();
    info!(
        source,
        path = %path.display(),
        contexts = ?context_names,
        "found kubeconfig contexts"
    );

    Ok(clusters)
}

fn default_kubeconfig_path() -> PathBuf {
    expand_tilde("~/.kube/config")
}

fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn expand_glob_pattern(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern_str = pattern.to_string_lossy();

    if !is_glob_pattern(&pattern_str) {
        return Ok(vec![pattern.to_path_buf()]);
    }

    let mut matches: Vec<PathBuf> = glob::glob(&pattern_str)
        .with_context(|| format!("invalid glob pattern {pattern_str:?}"))?
        .filter_map(|entry| entry.ok())
        .collect();
    matches.sort();

    Ok(matches)
}

/// Expand a leading `~` or `~/` to the home directory; `~user` is left as-is.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};

    static FILE_SEQ: AtomicU32 = AtomicU32::new(0);

    fn write_kubeconfig(contexts: &[(&str, Option<&str>)]) -> PathBuf {
        let mut body = String::from("apiVersion: v1\nkind: Config\nclusters: []\nusers: []\ncontexts:\n");
        for (name, namespace) in contexts {
            body.push_str(&format!("- name: {name}\n  context:\n    cluster: {name}\n    user: {name}-user\n"));
            if let Some(ns) = namespace {
                body.push_str(&format!("    namespace: {ns}\n"));
            }
        }
        body.push_str(&format!("current-context: {}\n", contexts[0].0));

        let path = std::env::temp_dir().join(format!(
            "podrelay-kubeconfig-{}-{}.yaml",
            std::process::id(),
            FILE_SEQ.fetch_add(1, Ordering::SeqCst),
        ));
        fs::write(&path, body).unwrap();
        path
    }

    fn resolved(name: &str, namespace: &str) -> ResolvedCluster {
        ResolvedCluster {
            name: name.to_string(),
            kubeconfig: PathBuf::from("/tmp/kubeconfig"),
            context: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    #[test]
    fn test_load_kubeconfig_contexts_and_namespaces() {
        let path = write_kubeconfig(&[("staging", Some("apps")), ("production", None)]);
        let mut seen = HashSet::new();

        let clusters = load_kubeconfig_file(&path, "test", &mut seen).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(clusters.len(), 2);

        let staging = clusters.iter().find(|c| c.name == "staging").unwrap();
        assert_eq!(staging.namespace, "apps");
        assert_eq!(staging.context, "staging");

        let production = clusters.iter().find(|c| c.name == "production").unwrap();
        assert_eq!(production.namespace, "default");
    }

    #[test]
    fn test_load_kubeconfig_dedup_by_path() {
        let path = write_kubeconfig(&[("staging", None)]);
        let mut seen = HashSet::new();

        let first = load_kubeconfig_file(&path, "test", &mut seen).unwrap();
        let second = load_kubeconfig_file(&path, "test", &mut seen).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn test_validate_clusters_accepts_unique_names() {
        let clusters = vec![resolved("production", "default"), resolved("staging", "apps")];
        validate_clusters(&clusters).unwrap();
    }

    #[test]
    fn test_validate_clusters_rejects_empty_list() {
        assert!(validate_clusters(&[]).is_err());
    }

    #[test]
    fn test_validate_clusters_rejects_empty_name() {
        let clusters = vec![resolved("", "default")];
        assert!(validate_clusters(&clusters).is_err());
    }

    #[test]
    fn test_validate_clusters_rejects_dotted_name() {
        let clusters = vec![resolved("prod.eu", "default")];
        let err = validate_clusters(&clusters).unwrap_err();
        assert!(err.to_string().contains("must not contain dots"));
    }

    #[test]
    fn test_validate_clusters_rejects_duplicates() {
        let clusters = vec![resolved("staging", "a"), resolved("staging", "b")];
        let err = validate_clusters(&clusters).unwrap_err();
        assert!(err.to_string().contains("duplicate cluster name"));
    }

    #[test]
    fn test_expand_glob_pattern_plain_path_passes_through() {
        let paths = expand_glob_pattern(Path::new("/etc/podrelay/config.yaml")).unwrap();
        assert_eq!(paths, vec![PathBuf::from("/etc/podrelay/config.yaml")]);
    }

    #[test]
    fn test_expand_glob_pattern_matches_sorted() {
        let dir = std::env::temp_dir().join(format!("podrelay-glob-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.yaml"), "").unwrap();
        fs::write(dir.join("a.yaml"), "").unwrap();

        let paths = expand_glob_pattern(&dir.join("*.yaml")).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a.yaml"));
        assert!(paths[1].ends_with("b.yaml"));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        // "~user" form is not expanded
        assert_eq!(expand_tilde("~other/x"), PathBuf::from("~other/x"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~"), home);
            assert_eq!(expand_tilde("~/.kube/config"), home.join(".kube/config"));
        }
    }
}
