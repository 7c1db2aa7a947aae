// Copyright 2023 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

///
/// One named source repository: its root on disk and the file names that hold target and
/// rule definitions within each module directory.
///
#[derive(Clone, Debug)]
pub struct RepositoryInfo {
    pub root: PathBuf,
    pub targets_file_name: String,
    pub rules_file_name: String,
}

impl RepositoryInfo {
    pub fn new<P: AsRef<Path>>(root: P) -> RepositoryInfo {
        RepositoryInfo {
            root: root.as_ref().to_path_buf(),
            targets_file_name: "TARGETS".to_string(),
            rules_file_name: "RULES".to_string(),
        }
    }
}

///
/// The repository configuration captured once at startup and threaded, by handle, through
/// every component that resolves repository-relative names. Immutable after construction.
///
#[derive(Clone, Debug, Default)]
pub struct RepositoryConfig {
    repositories: HashMap<String, RepositoryInfo>,
}

impl RepositoryConfig {
    pub fn new() -> RepositoryConfig {
        RepositoryConfig::default()
    }

    pub fn with_repository(
        mut self,
        name: impl Into<String>,
        info: RepositoryInfo,
    ) -> RepositoryConfig {
        self.repositories.insert(name.into(), info);
        self
    }

    pub fn info(&self, repository: &str) -> Result<&RepositoryInfo, String> {
        self.repositories
            .get(repository)
            .ok_or_else(|| format!("Unknown repository {repository:?}"))
    }

    pub fn root(&self, repository: &str) -> Result<&Path, String> {
        self.info(repository).map(|info| info.root.as_path())
    }
}
