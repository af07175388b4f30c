//! Depot-path to repository-path mapping: wildcard escaping, prefix
//! matching, include/exclude filtering, and optional client-view
//! translation.

use std::collections::HashMap;

use anyhow::Result;
use tracing::warn;

use crate::p4::P4;

/// Decode the depot's escaped wildcard characters. `%25` must be decoded
/// last or an escaped escape would double-decode.
pub fn wildcard_decode(path: &str) -> String {
    path.replace("%23", "#")
        .replace("%2A", "*")
        .replace("%2a", "*")
        .replace("%40", "@")
        .replace("%25", "%")
}

/// Encode wildcard characters for a path headed back to the depot. `%`
/// must be encoded first for the same reason it is decoded last.
pub fn wildcard_encode(path: &str) -> String {
    path.replace('%', "%25")
        .replace('#', "%23")
        .replace('*', "%2A")
        .replace('@', "%40")
}

pub fn wildcard_present(path: &str) -> bool {
    path.contains(['#', '*', '@', '%'])
}

/// Segment-aware prefix test: `//depot/foo` matches itself and anything
/// under `//depot/foo/`, never `//depot/foo2`.
pub fn path_starts_with(path: &str, prefix: &str, ignore_case: bool) -> bool {
    let (path_cmp, prefix_cmp) = if ignore_case {
        (path.to_lowercase(), prefix.to_lowercase())
    } else {
        (path.to_string(), prefix.to_string())
    };
    if prefix_cmp.ends_with('/') {
        return path_cmp.starts_with(&prefix_cmp);
    }
    path_cmp == prefix_cmp || path_cmp.starts_with(&format!("{prefix_cmp}/"))
}

/// One line of a client view, already reduced to the depot side and the
/// client side with the client-name prefix stripped.
#[derive(Debug, Clone)]
struct ViewMapping {
    depot_prefix: String,
    exclude: bool,
}

/// Client-view translation. The view's full mapping semantics live on
/// the server; rather than re-implement them we batch unresolved paths
/// through `p4 where` and cache the answers ("" marks an unmapped path).
#[derive(Debug, Default)]
pub struct ClientView {
    mappings: Vec<ViewMapping>,
    client_prefix: String,
    cache: HashMap<String, String>,
}

impl ClientView {
    /// Build from the `View0..ViewN` fields of `p4 client -o` output.
    pub fn from_spec(client_name: &str, view_lines: &[String]) -> Self {
        let mut mappings = Vec::new();
        for line in view_lines {
            let (depot_side, exclude) = match line.trim() {
                l if l.starts_with('-') => (&l[1..], true),
                l if l.starts_with('+') => (&l[1..], false),
                l => (l, false),
            };
            // Only the depot half matters for wantedness; strip quotes
            // and the trailing "..." wildcard.
            let depot = depot_side
                .split_whitespace()
                .next()
                .unwrap_or("")
                .trim_matches('"')
                .trim_end_matches("...")
                .to_string();
            if !depot.is_empty() {
                mappings.push(ViewMapping {
                    depot_prefix: depot,
                    exclude,
                });
            }
        }
        ClientView {
            mappings,
            client_prefix: format!("//{client_name}/"),
            cache: HashMap::new(),
        }
    }

    /// Whether any view line could map this path. Last matching line
    /// wins, matching server semantics.
    pub fn covers(&self, depot_path: &str) -> bool {
        let mut included = false;
        for mapping in &self.mappings {
            if path_starts_with(depot_path, &mapping.depot_prefix, false) {
                included = !mapping.exclude;
            }
        }
        included
    }

    /// Resolve uncached paths in one batched `p4 where` round trip.
    pub fn update_cache(&mut self, p4: &P4, depot_paths: &[String]) -> Result<()> {
        let missing: Vec<String> = depot_paths
            .iter()
            .filter(|p| !self.cache.contains_key(*p))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for record in p4.run_records_with_input(&["where"], &missing)? {
            if record.is_error() {
                continue;
            }
            let depot = match record.text("depotFile") {
                Some(d) => d,
                None => continue,
            };
            if record.contains("unmap") {
                self.cache.insert(depot, String::new());
                continue;
            }
            let client = record.text("clientFile").unwrap_or_default();
            let relative = client
                .strip_prefix(&self.client_prefix)
                .unwrap_or(&client)
                .to_string();
            self.cache.insert(depot, relative);
        }
        // Paths the server never answered for are unmapped.
        for path in missing {
            self.cache.entry(path).or_default();
        }
        Ok(())
    }

    /// Repository-relative path for a depot file, if the view maps it.
    /// Requires a prior `update_cache` covering the path.
    pub fn map(&self, depot_path: &str) -> Option<String> {
        match self.cache.get(depot_path) {
            Some(rel) if !rel.is_empty() => Some(rel.clone()),
            Some(_) => None,
            None => {
                warn!(path = depot_path, "client view cache miss, treating as unmapped");
                None
            }
        }
    }
}

/// Decides which depot files belong in the repository and where they
/// land relative to its root.
#[derive(Debug, Default)]
pub struct PathMapper {
    /// Depot prefixes being imported, each normalized to end with '/'.
    pub depot_paths: Vec<String>,
    /// Prefixes carved back out of the include set.
    pub excludes: Vec<String>,
    /// Keep the depot directory structure instead of stripping the
    /// import prefix (multi-path and branch-detection imports).
    pub keep_repo_path: bool,
    pub ignore_case: bool,
    pub client_view: Option<ClientView>,
}

impl PathMapper {
    pub fn new(depot_paths: Vec<String>) -> Self {
        let depot_paths = depot_paths
            .into_iter()
            .map(|p| if p.ends_with('/') { p } else { format!("{p}/") })
            .collect();
        PathMapper {
            depot_paths,
            ..Default::default()
        }
    }

    fn is_excluded(&self, depot_path: &str) -> bool {
        self.excludes
            .iter()
            .any(|ex| path_starts_with(depot_path, ex, self.ignore_case))
    }

    /// Whether a depot file participates in the import at all.
    pub fn is_wanted(&self, depot_path: &str) -> bool {
        if self.is_excluded(depot_path) {
            return false;
        }
        if let Some(view) = &self.client_view {
            return view.covers(depot_path);
        }
        self.depot_paths
            .iter()
            .any(|prefix| path_starts_with(depot_path, prefix, self.ignore_case))
    }

    /// Repository-relative path for a wanted depot file, wildcard-decoded.
    pub fn repo_path(&self, depot_path: &str) -> Option<String> {
        if self.is_excluded(depot_path) {
            return None;
        }
        if let Some(view) = &self.client_view {
            return view.map(depot_path).map(|p| wildcard_decode(&p));
        }
        let prefix = self
            .depot_paths
            .iter()
            .filter(|p| path_starts_with(depot_path, p, self.ignore_case))
            .max_by_key(|p| p.len())?;
        let relative = if self.keep_repo_path {
            // Keep the depot layout below the "//" root.
            depot_path.trim_start_matches('/')
        } else {
            &depot_path[prefix.len()..]
        };
        Some(wildcard_decode(relative))
    }

    /// Batched client-view resolution; no-op without a view.
    pub fn prime(&mut self, p4: &P4, depot_paths: &[String]) -> Result<()> {
        if let Some(view) = &mut self.client_view {
            view.update_cache(p4, depot_paths)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_decode_order() {
        assert_eq!(wildcard_decode("a%2540b"), "a%40b");
        assert_eq!(wildcard_decode("file%23v%2A%40"), "file#v*@");
    }

    #[test]
    fn wildcard_encode_order() {
        assert_eq!(wildcard_encode("a%40b"), "a%2540b");
        assert_eq!(wildcard_encode("file#v*@"), "file%23v%2A%40");
    }

    #[test]
    fn prefix_matching_is_segment_aware() {
        assert!(path_starts_with("//depot/foo/a.txt", "//depot/foo", false));
        assert!(path_starts_with("//depot/foo", "//depot/foo", false));
        assert!(!path_starts_with("//depot/foo2/a.txt", "//depot/foo", false));
        assert!(path_starts_with("//depot/FOO/a.txt", "//depot/foo/", true));
        assert!(!path_starts_with("//depot/FOO/a.txt", "//depot/foo/", false));
    }

    #[test]
    fn mapper_strips_longest_prefix() {
        let mapper = PathMapper::new(vec!["//depot/main".to_string()]);
        assert_eq!(
            mapper.repo_path("//depot/main/src/a.rs").as_deref(),
            Some("src/a.rs")
        );
        assert!(mapper.repo_path("//depot/other/a.rs").is_none());
    }

    #[test]
    fn mapper_respects_excludes() {
        let mut mapper = PathMapper::new(vec!["//depot/main/".to_string()]);
        mapper.excludes.push("//depot/main/vendor/".to_string());
        assert!(mapper.is_wanted("//depot/main/src/a.rs"));
        assert!(!mapper.is_wanted("//depot/main/vendor/lib.rs"));
        assert!(mapper.repo_path("//depot/main/vendor/lib.rs").is_none());
    }

    #[test]
    fn mapper_keep_repo_path() {
        let mut mapper = PathMapper::new(vec!["//depot/main/".to_string()]);
        mapper.keep_repo_path = true;
        assert_eq!(
            mapper.repo_path("//depot/main/src/a.rs").as_deref(),
            Some("depot/main/src/a.rs")
        );
    }

    #[test]
    fn mapper_decodes_wildcards() {
        let mapper = PathMapper::new(vec!["//depot/".to_string()]);
        assert_eq!(
            mapper.repo_path("//depot/a%23b.txt").as_deref(),
            Some("a#b.txt")
        );
    }

    #[test]
    fn client_view_last_line_wins() {
        let view = ClientView::from_spec(
            "ws",
            &[
                "//depot/main/... //ws/main/...".to_string(),
                "-//depot/main/secret/... //ws/main/secret/...".to_string(),
            ],
        );
        assert!(view.covers("//depot/main/src/a.rs"));
        assert!(!view.covers("//depot/main/secret/key.pem"));
    }
}
