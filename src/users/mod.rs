//! Depot-account to committer-identity resolution, with an on-disk cache
//! so repeated runs avoid the server round trip.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use tracing::{debug, warn};

use crate::p4::P4;

/// Maps depot user ids to `Name <email>` committer identities. The
/// server is asked at most once per run; unknown ids after that get a
/// placeholder identity rather than failing the import.
#[derive(Debug, Default)]
pub struct UserMap {
    users: HashMap<String, String>,
    refreshed: bool,
    cache_path: Option<PathBuf>,
}

impl UserMap {
    /// Load from the per-user cache file if one exists.
    pub fn load() -> Self {
        let cache_path = ProjectDirs::from("", "", "depotsync")
            .map(|dirs| dirs.cache_dir().join("usercache.txt"));
        let mut map = UserMap {
            cache_path,
            ..Default::default()
        };
        if let Some(path) = &map.cache_path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                for line in contents.lines() {
                    if let Some((user, identity)) = line.split_once('\t') {
                        map.users.insert(user.to_string(), identity.to_string());
                    }
                }
                debug!(entries = map.users.len(), "loaded user cache");
            }
        }
        map
    }

    #[cfg(test)]
    pub fn with_entries(entries: &[(&str, &str)]) -> Self {
        let mut map = UserMap::default();
        for (user, identity) in entries {
            map.users.insert(user.to_string(), identity.to_string());
        }
        map.refreshed = true;
        map
    }

    fn refresh(&mut self, p4: &P4) -> Result<()> {
        self.refreshed = true;
        for record in p4.run_records(&["users"])? {
            let (user, name) = match (record.text("User"), record.text("FullName")) {
                (Some(u), Some(n)) => (u, n),
                _ => continue,
            };
            let email = record.text("Email").unwrap_or_default();
            self.users.insert(user, format!("{name} <{email}>"));
        }
        self.save();
        Ok(())
    }

    fn save(&self) {
        let path = match &self.cache_path {
            Some(p) => p,
            None => return,
        };
        let write = || -> Result<()> {
            if let Some(parent) = path.parent() {
                crate::util::ensure_dir(parent)?;
            }
            let mut contents = String::new();
            let mut entries: Vec<_> = self.users.iter().collect();
            entries.sort();
            for (user, identity) in entries {
                contents.push_str(user);
                contents.push('\t');
                contents.push_str(identity);
                contents.push('\n');
            }
            std::fs::write(path, contents)
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(())
        };
        if let Err(err) = write() {
            warn!(error = %err, "could not persist user cache");
        }
    }

    /// Committer identity for a depot user id. Refreshes from the server
    /// once on the first miss.
    pub fn identity_for(&mut self, p4: &P4, user: &str) -> String {
        if let Some(identity) = self.users.get(user) {
            return identity.clone();
        }
        if !self.refreshed {
            if let Err(err) = self.refresh(p4) {
                warn!(error = %err, "user listing failed, using placeholder identities");
            }
            if let Some(identity) = self.users.get(user) {
                return identity.clone();
            }
        }
        warn!(user, "unknown depot user");
        format!("{user} <a@b>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_user_resolves_without_server() {
        let mut map = UserMap::with_entries(&[("alice", "Alice Doe <alice@example.com>")]);
        let identity = map.identity_for(&P4::new(), "alice");
        assert_eq!(identity, "Alice Doe <alice@example.com>");
    }

    #[test]
    fn unknown_user_gets_placeholder() {
        let mut map = UserMap::with_entries(&[]);
        assert_eq!(map.identity_for(&P4::new(), "ghost"), "ghost <a@b>");
    }
}
