//! Per-target mutual exclusion for operations that change files or
//! machine-wide state.
//!
//! The guard is a small table of in-flight operations behind one coarse
//! lock. Acquisition never waits: a caller either gets an
//! [`OperationPermit`] or an immediate [`Conflict`] naming the blocker.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How an operation kind interacts with other in-flight operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KindClass {
    /// Touches shared machine state; one instance system-wide.
    Global,
    /// Modifies a project's files; one mutating operation per target.
    Mutating,
    /// Never conflicts with anything but its own exact key.
    ReadOnly,
}

/// Closed vocabulary of operation kinds.
///
/// Every variant is classified in [`OperationKind::class`], so a new kind
/// cannot be added without deciding whether it needs mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Build,
    Restore,
    Publish,
    Test,
    Run,
    Watch,
    Clean,
    Pack,
    AddPackage,
    RemovePackage,
    AddReference,
    RemoveReference,
    SolutionAdd,
    SolutionRemove,
    New,
    Format,
    ClearNugetCache,
    CertificateTrust,
    CertificateClean,
    ToolInstallGlobal,
    ToolUninstallGlobal,
    Info,
    Version,
    ListSdks,
    ListRuntimes,
    ListPackages,
    ListReferences,
    ListTemplates,
    SearchPackages,
    /// Unrecognised tag; treated as read-only.
    Other(String),
}

impl OperationKind {
    #[must_use]
    pub fn class(&self) -> KindClass {
        match self {
            OperationKind::ClearNugetCache
            | OperationKind::CertificateTrust
            | OperationKind::CertificateClean
            | OperationKind::ToolInstallGlobal
            | OperationKind::ToolUninstallGlobal => KindClass::Global,
            OperationKind::Build
            | OperationKind::Restore
            | OperationKind::Publish
            | OperationKind::Test
            | OperationKind::Run
            | OperationKind::Watch
            | OperationKind::Clean
            | OperationKind::Pack
            | OperationKind::AddPackage
            | OperationKind::RemovePackage
            | OperationKind::AddReference
            | OperationKind::RemoveReference
            | OperationKind::SolutionAdd
            | OperationKind::SolutionRemove
            | OperationKind::New
            | OperationKind::Format => KindClass::Mutating,
            OperationKind::Info
            | OperationKind::Version
            | OperationKind::ListSdks
            | OperationKind::ListRuntimes
            | OperationKind::ListPackages
            | OperationKind::ListReferences
            | OperationKind::ListTemplates
            | OperationKind::SearchPackages
            | OperationKind::Other(_) => KindClass::ReadOnly,
        }
    }

    /// Parse a kind tag. Unknown tags become [`OperationKind::Other`].
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let normalized = tag.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "build" => OperationKind::Build,
            "restore" => OperationKind::Restore,
            "publish" => OperationKind::Publish,
            "test" => OperationKind::Test,
            "run" => OperationKind::Run,
            "watch" | "watch-run" | "watch-test" | "watch-build" => OperationKind::Watch,
            "clean" => OperationKind::Clean,
            "pack" => OperationKind::Pack,
            "add-package" => OperationKind::AddPackage,
            "remove-package" => OperationKind::RemovePackage,
            "add-reference" => OperationKind::AddReference,
            "remove-reference" => OperationKind::RemoveReference,
            "solution-add" => OperationKind::SolutionAdd,
            "solution-remove" => OperationKind::SolutionRemove,
            "new" => OperationKind::New,
            "format" => OperationKind::Format,
            "clear-nuget-cache" | "nuget-locals-clear" => OperationKind::ClearNugetCache,
            "certificate-trust" => OperationKind::CertificateTrust,
            "certificate-clean" => OperationKind::CertificateClean,
            "tool-install-global" => OperationKind::ToolInstallGlobal,
            "tool-uninstall-global" => OperationKind::ToolUninstallGlobal,
            "info" => OperationKind::Info,
            "version" => OperationKind::Version,
            "list-sdks" => OperationKind::ListSdks,
            "list-runtimes" => OperationKind::ListRuntimes,
            "list-packages" => OperationKind::ListPackages,
            "list-references" => OperationKind::ListReferences,
            "list-templates" => OperationKind::ListTemplates,
            "search-packages" => OperationKind::SearchPackages,
            _ => OperationKind::Other(normalized),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::Build => "build",
            OperationKind::Restore => "restore",
            OperationKind::Publish => "publish",
            OperationKind::Test => "test",
            OperationKind::Run => "run",
            OperationKind::Watch => "watch",
            OperationKind::Clean => "clean",
            OperationKind::Pack => "pack",
            OperationKind::AddPackage => "add-package",
            OperationKind::RemovePackage => "remove-package",
            OperationKind::AddReference => "add-reference",
            OperationKind::RemoveReference => "remove-reference",
            OperationKind::SolutionAdd => "solution-add",
            OperationKind::SolutionRemove => "solution-remove",
            OperationKind::New => "new",
            OperationKind::Format => "format",
            OperationKind::ClearNugetCache => "clear-nuget-cache",
            OperationKind::CertificateTrust => "certificate-trust",
            OperationKind::CertificateClean => "certificate-clean",
            OperationKind::ToolInstallGlobal => "tool-install-global",
            OperationKind::ToolUninstallGlobal => "tool-uninstall-global",
            OperationKind::Info => "info",
            OperationKind::Version => "version",
            OperationKind::ListSdks => "list-sdks",
            OperationKind::ListRuntimes => "list-runtimes",
            OperationKind::ListPackages => "list-packages",
            OperationKind::ListReferences => "list-references",
            OperationKind::ListTemplates => "list-templates",
            OperationKind::SearchPackages => "search-packages",
            OperationKind::Other(tag) => tag,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OperationKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OperationKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|tag| OperationKind::parse(&tag))
    }
}

/// Normalize a target path into the guard's lookup key.
///
/// Empty means global scope. Otherwise the path is made absolute, `.` and
/// `..` are folded lexically, separators become `/` and the result is
/// lower-cased. If the path cannot be made absolute, the lower-cased input
/// is used as-is.
#[must_use]
pub fn normalize_target(target: &str) -> String {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let resolved = match std::path::absolute(trimmed) {
        Ok(path) => fold_components(&path).to_string_lossy().into_owned(),
        Err(err) => {
            debug!(path = trimmed, error = %err, "could not resolve target path");
            trimmed.to_string()
        }
    };

    let mut normalized = resolved.replace('\\', "/").to_lowercase();
    while normalized.len() > 1 && normalized.ends_with('/') && !normalized.ends_with(":/") {
        normalized.pop();
    }
    normalized
}

fn fold_components(path: &Path) -> PathBuf {
    let mut folded = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                folded.pop();
            }
            other => folded.push(other.as_os_str()),
        }
    }
    folded
}

/// Snapshot of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOperation {
    pub kind: String,
    pub target: String,
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
}

impl ActiveOperation {
    /// `"{kind} on {target} (started at {timestamp})"`.
    #[must_use]
    pub fn describe(&self) -> String {
        let target = if self.target.is_empty() {
            "<global>"
        } else {
            self.target.as_str()
        };
        format!(
            "{} on {} (started at {})",
            self.kind,
            target,
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Rejection returned by [`ConflictGuard::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub blocking: ActiveOperation,
}

impl Conflict {
    #[must_use]
    pub fn description(&self) -> String {
        self.blocking.describe()
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conflicting operation in progress: {}", self.description())
    }
}

impl std::error::Error for Conflict {}

type Key = (String, String);

#[derive(Debug)]
struct Entry {
    class: KindClass,
    operation_id: String,
    started_at: DateTime<Utc>,
    token: u64,
}

#[derive(Debug, Default)]
struct GuardState {
    active: Mutex<HashMap<Key, Entry>>,
    next_token: AtomicU64,
}

impl GuardState {
    fn table(&self) -> MutexGuard<'_, HashMap<Key, Entry>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot(key: &Key, entry: &Entry) -> ActiveOperation {
    ActiveOperation {
        kind: key.0.clone(),
        target: key.1.clone(),
        operation_id: entry.operation_id.clone(),
        started_at: entry.started_at,
    }
}

/// Lock manager for conflicting operations. Cheap to clone; clones share
/// one table.
#[derive(Debug, Clone, Default)]
pub struct ConflictGuard {
    state: Arc<GuardState>,
}

impl ConflictGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to register `kind` on `target`. Never blocks.
    pub fn try_acquire(
        &self,
        kind: &OperationKind,
        target: &str,
        operation_id: &str,
    ) -> Result<OperationPermit, Conflict> {
        let target = normalize_target(target);
        let kind_tag = kind.as_str().to_string();
        let class = kind.class();
        let key = (kind_tag, target);

        let mut table = self.state.table();

        let blocker = table.get_key_value(&key).or_else(|| match class {
            KindClass::Global => table.iter().find(|(other, _)| other.0 == key.0),
            KindClass::Mutating => table
                .iter()
                .find(|(other, entry)| other.1 == key.1 && entry.class == KindClass::Mutating),
            KindClass::ReadOnly => None,
        });

        if let Some((blocking_key, entry)) = blocker {
            let conflict = Conflict {
                blocking: snapshot(blocking_key, entry),
            };
            info!(
                kind = %key.0,
                path = %key.1,
                operation_id,
                blocking = %conflict.description(),
                "operation rejected"
            );
            return Err(conflict);
        }

        let token = self.state.next_token.fetch_add(1, Ordering::Relaxed);
        table.insert(
            key.clone(),
            Entry {
                class,
                operation_id: operation_id.to_string(),
                started_at: Utc::now(),
                token,
            },
        );
        drop(table);

        debug!(kind = %key.0, path = %key.1, operation_id, "operation lock granted");
        Ok(OperationPermit {
            state: Arc::clone(&self.state),
            key,
            token,
            released: false,
        })
    }

    /// Remove the entry for `(kind, target)`. Missing entries are ignored.
    pub fn release(&self, kind: &OperationKind, target: &str) {
        let key = (kind.as_str().to_string(), normalize_target(target));
        if self.state.table().remove(&key).is_some() {
            debug!(kind = %key.0, path = %key.1, "operation lock released");
        }
    }

    /// In-flight operations, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<ActiveOperation> {
        let mut active: Vec<_> = self
            .state
            .table()
            .iter()
            .map(|(key, entry)| snapshot(key, entry))
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }
}

/// Proof of a granted lock. Dropping it releases the lock.
///
/// A permit only removes the entry it created: if the entry was released
/// explicitly and re-acquired by someone else, dropping the old permit
/// leaves the new holder alone.
#[derive(Debug)]
pub struct OperationPermit {
    state: Arc<GuardState>,
    key: Key,
    token: u64,
    released: bool,
}

impl OperationPermit {
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.key.0
    }

    /// Normalized target.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.key.1
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut table = self.state.table();
        if table.get(&self.key).is_some_and(|entry| entry.token == self.token) {
            table.remove(&self.key);
            debug!(kind = %self.key.0, path = %self.key.1, "operation lock released");
        }
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn different_mutating_kinds_exclude_each_other_on_one_target() {
        let guard = ConflictGuard::new();
        let permit = guard
            .try_acquire(&OperationKind::Build, "/work/App", "op-1")
            .expect("first acquire");

        let conflict = guard
            .try_acquire(&OperationKind::Restore, "/work/App", "op-2")
            .expect_err("restore must wait for build");
        assert_eq!(conflict.blocking.kind, "build");
        assert_eq!(conflict.blocking.operation_id, "op-1");

        drop(permit);
        assert!(
            guard
                .try_acquire(&OperationKind::Restore, "/work/App", "op-3")
                .is_ok()
        );
    }

    #[test]
    fn mutating_operations_on_different_targets_run_in_parallel() {
        let guard = ConflictGuard::new();
        let _a = guard
            .try_acquire(&OperationKind::Build, "/work/A", "a")
            .expect("a");
        let _b = guard
            .try_acquire(&OperationKind::Build, "/work/B", "b")
            .expect("b");
        assert_eq!(guard.active().len(), 2);
    }

    #[test]
    fn global_kinds_are_exclusive_across_targets() {
        let guard = ConflictGuard::new();
        let _first = guard
            .try_acquire(&OperationKind::CertificateTrust, "", "op-1")
            .expect("first");
        let conflict = guard
            .try_acquire(&OperationKind::CertificateTrust, "/elsewhere", "op-2")
            .expect_err("second global must conflict");
        assert!(conflict.description().starts_with("certificate-trust on <global> (started at "));

        assert!(
            guard
                .try_acquire(&OperationKind::ClearNugetCache, "", "op-3")
                .is_ok()
        );
    }

    #[test]
    fn read_only_kinds_only_conflict_on_their_exact_key() {
        let guard = ConflictGuard::new();
        let _build = guard
            .try_acquire(&OperationKind::Build, "/work/App", "op-1")
            .expect("build");
        let _list = guard
            .try_acquire(&OperationKind::ListPackages, "/work/App", "op-2")
            .expect("read-only next to a build");
        let _custom = guard
            .try_acquire(&OperationKind::parse("inspect-graph"), "/work/App", "op-3")
            .expect("unknown kinds are read-only");
        assert!(
            guard
                .try_acquire(&OperationKind::ListPackages, "/work/App", "op-4")
                .is_err()
        );
    }

    #[test]
    fn release_is_idempotent_and_leaves_other_keys_alone() {
        let guard = ConflictGuard::new();
        let _other = guard
            .try_acquire(&OperationKind::Build, "/work/Other", "other")
            .expect("other");
        let permit = guard
            .try_acquire(&OperationKind::Build, "/work/App", "app")
            .expect("app");
        std::mem::forget(permit);

        guard.release(&OperationKind::Build, "/work/App");
        guard.release(&OperationKind::Build, "/work/App");
        guard.release(&OperationKind::Test, "/never/acquired");

        let active = guard.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].operation_id, "other");
    }

    #[test]
    fn stale_permit_does_not_release_newer_holder() {
        let guard = ConflictGuard::new();
        let stale = guard
            .try_acquire(&OperationKind::Build, "/work/App", "old")
            .expect("old");
        guard.release(&OperationKind::Build, "/work/App");
        let _fresh = guard
            .try_acquire(&OperationKind::Build, "/work/App", "new")
            .expect("new");

        drop(stale);
        let active = guard.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].operation_id, "new");
    }

    #[test]
    fn equivalent_paths_share_one_key() {
        let guard = ConflictGuard::new();
        let _permit = guard
            .try_acquire(&OperationKind::Build, "/Work/App/", "op-1")
            .expect("first");
        assert!(
            guard
                .try_acquire(&OperationKind::Publish, "/work/./lib/../app", "op-2")
                .is_err()
        );
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_target(""), "");
        assert_eq!(normalize_target("   "), "");
        let relative = normalize_target("Some/Project");
        assert!(relative.ends_with("some/project"));
        assert!(Path::new(&relative).is_absolute() || relative.contains(':'));
        #[cfg(unix)]
        assert_eq!(normalize_target("/"), "/");
    }

    #[test]
    fn concurrent_acquires_grant_exactly_one() {
        let guard = ConflictGuard::new();
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let guard = guard.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let kind = if i % 2 == 0 {
                        OperationKind::Build
                    } else {
                        OperationKind::Test
                    };
                    guard
                        .try_acquire(&kind, "/work/Race", &format!("op-{i}"))
                        .map(std::mem::forget)
                        .is_ok()
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 1);
    }

    #[test]
    fn kind_vocabulary_round_trips() {
        for tag in ["build", "watch", "certificate-trust", "list-sdks"] {
            assert_eq!(OperationKind::parse(tag).as_str(), tag);
        }
        assert_eq!(OperationKind::parse("Watch_Test"), OperationKind::Watch);
        assert_eq!(OperationKind::parse("format").class(), KindClass::Mutating);
        assert_eq!(
            OperationKind::parse("tool-install-global").class(),
            KindClass::Global
        );
    }
}
