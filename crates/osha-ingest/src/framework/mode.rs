//! Load modes and the per-document decision table

use serde::{Deserialize, Serialize};

/// How a load treats documents whose logical key already exists
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum LoadMode {
    /// Empty the loader's tables once, then insert every document
    TruncateLoad,
    /// Skip unchanged documents, version changed ones
    #[default]
    Incremental,
    /// Overwrite the existing row in place when changed (or forced)
    UpdateExisting,
    /// Decide and report only; never write
    ValidateOnly,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::TruncateLoad => "truncate_load",
            LoadMode::Incremental => "incremental",
            LoadMode::UpdateExisting => "update_existing",
            LoadMode::ValidateOnly => "validate_only",
        }
    }

    /// Whether documents in this mode reach the database at all
    pub fn writes(&self) -> bool {
        !matches!(self, LoadMode::ValidateOnly)
    }
}

impl std::str::FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "truncate_load" | "truncate" => Ok(LoadMode::TruncateLoad),
            "incremental" => Ok(LoadMode::Incremental),
            "update_existing" | "update" => Ok(LoadMode::UpdateExisting),
            "validate_only" | "validate" => Ok(LoadMode::ValidateOnly),
            other => Err(format!("Unknown load mode: {other}")),
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent stored row for a logical key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingVersion {
    pub id: i64,
    pub content_hash: String,
    pub is_current: bool,
}

/// What to do with one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave the stored row untouched
    Skip { id: i64 },
    /// Insert a new current row; `supersedes` is the row being demoted, if any
    InsertNewVersion { supersedes: Option<i64> },
    /// Rewrite row `id` (and its child rows) keeping its identity
    UpdateInPlace { id: i64 },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::Skip { .. } => "skip",
            Action::InsertNewVersion { supersedes: None } => "insert",
            Action::InsertNewVersion { supersedes: Some(_) } => "new_version",
            Action::UpdateInPlace { .. } => "update",
        }
    }
}

/// Decide the action for a document from mode, stored state and hash
///
/// `validate_only` answers with the `incremental` outcome so the report shows
/// what an incremental run would do.
pub fn decide_action(
    mode: LoadMode,
    existing: Option<&ExistingVersion>,
    new_hash: &str,
    force: bool,
) -> Action {
    let Some(existing) = existing else {
        return Action::InsertNewVersion { supersedes: None };
    };
    let unchanged = existing.content_hash == new_hash;

    match mode {
        LoadMode::TruncateLoad => Action::InsertNewVersion {
            supersedes: Some(existing.id),
        },
        LoadMode::UpdateExisting if unchanged && !force => Action::Skip { id: existing.id },
        LoadMode::UpdateExisting => Action::UpdateInPlace { id: existing.id },
        LoadMode::Incremental | LoadMode::ValidateOnly if unchanged && !force => {
            Action::Skip { id: existing.id }
        },
        LoadMode::Incremental | LoadMode::ValidateOnly => Action::InsertNewVersion {
            supersedes: Some(existing.id),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn stored(hash: &str) -> ExistingVersion {
        ExistingVersion {
            id: 7,
            content_hash: hash.to_string(),
            is_current: true,
        }
    }

    #[test]
    fn test_absent_key_always_inserts() {
        for mode in [
            LoadMode::TruncateLoad,
            LoadMode::Incremental,
            LoadMode::UpdateExisting,
            LoadMode::ValidateOnly,
        ] {
            assert_eq!(
                decide_action(mode, None, "h1", false),
                Action::InsertNewVersion { supersedes: None }
            );
        }
    }

    #[test]
    fn test_incremental() {
        let existing = stored("h1");
        assert_eq!(
            decide_action(LoadMode::Incremental, Some(&existing), "h1", false),
            Action::Skip { id: 7 }
        );
        assert_eq!(
            decide_action(LoadMode::Incremental, Some(&existing), "h2", false),
            Action::InsertNewVersion { supersedes: Some(7) }
        );
        assert_eq!(
            decide_action(LoadMode::Incremental, Some(&existing), "h1", true),
            Action::InsertNewVersion { supersedes: Some(7) }
        );
    }

    #[test]
    fn test_update_existing() {
        let existing = stored("h1");
        assert_eq!(
            decide_action(LoadMode::UpdateExisting, Some(&existing), "h1", false),
            Action::Skip { id: 7 }
        );
        assert_eq!(
            decide_action(LoadMode::UpdateExisting, Some(&existing), "h1", true),
            Action::UpdateInPlace { id: 7 }
        );
        assert_eq!(
            decide_action(LoadMode::UpdateExisting, Some(&existing), "h2", false),
            Action::UpdateInPlace { id: 7 }
        );
    }

    #[test]
    fn test_truncate_load_inserts_even_when_unchanged() {
        let existing = stored("h1");
        assert_eq!(
            decide_action(LoadMode::TruncateLoad, Some(&existing), "h1", false),
            Action::InsertNewVersion { supersedes: Some(7) }
        );
    }

    #[test]
    fn test_validate_only_mirrors_incremental() {
        let existing = stored("h1");
        for (hash, force) in [("h1", false), ("h2", false), ("h1", true)] {
            assert_eq!(
                decide_action(LoadMode::ValidateOnly, Some(&existing), hash, force),
                decide_action(LoadMode::Incremental, Some(&existing), hash, force)
            );
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("truncate_load".parse::<LoadMode>().unwrap(), LoadMode::TruncateLoad);
        assert_eq!("update-existing".parse::<LoadMode>().unwrap(), LoadMode::UpdateExisting);
        assert_eq!("VALIDATE_ONLY".parse::<LoadMode>().unwrap(), LoadMode::ValidateOnly);
        assert!("append".parse::<LoadMode>().is_err());
        assert_eq!(LoadMode::default().to_string(), "incremental");
    }
}
