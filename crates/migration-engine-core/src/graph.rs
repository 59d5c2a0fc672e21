use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info};

use crate::{EngineError, LoadError, Migration, Version, VersionId, VersionScheme};

pub const MIGRATION_FILE_EXTENSION: &str = "sql";

const SEQUENCE_WIDTH: usize = 4;

/// Linear chain of migrations, sorted ascending by version.
///
/// Positions are counted from base: base is position 0 and the first
/// migration is position 1.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MigrationGraph {
    migrations: Vec<Migration>,
    scheme: VersionScheme,
}

impl MigrationGraph {
    /// Load every `<version>_<label>.sql` file in `dir` and validate the chain.
    ///
    /// Hidden files, subdirectories and files with other extensions are ignored.
    ///
    /// # Errors
    /// Returns [`LoadError::Io`] when the directory or a file cannot be read,
    /// [`LoadError::Malformed`] for bad names or contents, and
    /// [`LoadError::GraphIntegrity`] for unsortable, duplicate, or (under the
    /// sequence scheme) non-contiguous versions.
    pub fn load(dir: &Path, scheme: VersionScheme) -> Result<Self, LoadError> {
        let entries = fs::read_dir(dir).map_err(|err| io_error(dir, &err))?;

        let mut migrations = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| io_error(dir, &err))?.path();
            if !path.is_file() {
                continue;
            }
            let Some((version, label)) = split_file_name(&path)? else {
                continue;
            };

            let source = fs::read_to_string(&path).map_err(|err| io_error(&path, &err))?;
            migrations.push(Migration::from_source(version, &label, &source, path)?);
        }

        let graph = Self::from_migrations(migrations, scheme)?;
        debug!(
            dir = %dir.display(),
            scheme = scheme.as_str(),
            count = graph.len(),
            head = %graph.head(),
            "loaded migration graph"
        );
        Ok(graph)
    }

    /// Validate an in-memory set of migrations as a chain.
    ///
    /// # Errors
    /// Returns [`LoadError::GraphIntegrity`] on duplicate versions or, under
    /// [`VersionScheme::Sequence`], any gap in `1..=n`.
    pub fn from_migrations(
        mut migrations: Vec<Migration>,
        scheme: VersionScheme,
    ) -> Result<Self, LoadError> {
        migrations.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.path.cmp(&b.path)));

        for pair in migrations.windows(2) {
            if let [previous, next] = pair {
                if previous.version == next.version {
                    return Err(LoadError::GraphIntegrity(format!(
                        "duplicate version {}: {} and {}",
                        next.version,
                        previous.path.display(),
                        next.path.display()
                    )));
                }
            }
        }

        if scheme == VersionScheme::Sequence {
            let mut expected = 1_u64;
            for migration in &migrations {
                if migration.version.0 != expected {
                    return Err(LoadError::GraphIntegrity(format!(
                        "sequence gap: expected version {expected}, found {} ({})",
                        migration.version,
                        migration.path.display()
                    )));
                }
                expected += 1;
            }
        }

        Ok(Self { migrations, scheme })
    }

    #[must_use]
    pub fn scheme(&self) -> VersionScheme {
        self.scheme
    }

    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    #[must_use]
    pub fn base(&self) -> VersionId {
        VersionId::Base
    }

    /// Last version in the chain, or base when the graph is empty.
    #[must_use]
    pub fn head(&self) -> VersionId {
        self.migrations.last().map_or(VersionId::Base, |migration| VersionId::At(migration.version))
    }

    #[must_use]
    pub fn get(&self, version: Version) -> Option<&Migration> {
        self.index_of(version).map(|index| &self.migrations[index])
    }

    #[must_use]
    pub fn contains(&self, id: VersionId) -> bool {
        self.position(id).is_some()
    }

    #[must_use]
    pub fn position(&self, id: VersionId) -> Option<usize> {
        match id {
            VersionId::Base => Some(0),
            VersionId::At(version) => self.index_of(version).map(|index| index + 1),
        }
    }

    #[must_use]
    pub fn at_position(&self, position: usize) -> Option<VersionId> {
        match position.checked_sub(1) {
            None => Some(VersionId::Base),
            Some(index) => self.migrations.get(index).map(|migration| VersionId::At(migration.version)),
        }
    }

    #[must_use]
    pub fn successor_of(&self, id: VersionId) -> Option<VersionId> {
        let position = self.position(id)?;
        self.at_position(position + 1)
    }

    #[must_use]
    pub fn predecessor_of(&self, id: VersionId) -> Option<VersionId> {
        let position = self.position(id)?;
        self.at_position(position.checked_sub(1)?)
    }

    /// Linear slice between two chain positions.
    ///
    /// When `from <= to` the result is ascending over `(from, to]`; otherwise
    /// it is descending over `(to, from]`. Returns `None` if either endpoint is
    /// not in the graph.
    #[must_use]
    pub fn all_between(&self, from: VersionId, to: VersionId) -> Option<Vec<&Migration>> {
        let from = self.position(from)?;
        let to = self.position(to)?;

        if from <= to {
            Some(self.migrations[from..to].iter().collect())
        } else {
            Some(self.migrations[to..from].iter().rev().collect())
        }
    }

    fn next_version(&self, now: OffsetDateTime) -> Version {
        let after_head = self.migrations.last().map_or(1, |migration| migration.version.0.saturating_add(1));
        match self.scheme {
            VersionScheme::Sequence => Version(after_head),
            VersionScheme::Timestamp => Version(timestamp_version(now).max(after_head)),
        }
    }

    fn index_of(&self, version: Version) -> Option<usize> {
        self.migrations.binary_search_by_key(&version, |migration| migration.version).ok()
    }
}

/// Create the migrations directory if it does not exist yet.
///
/// Returns `true` when the directory was created by this call.
///
/// # Errors
/// Returns [`EngineError::Scaffold`] when the directory cannot be created.
pub fn init_migrations_dir(dir: &Path) -> Result<bool, EngineError> {
    if dir.is_dir() {
        return Ok(false);
    }

    fs::create_dir_all(dir).map_err(|err| EngineError::Scaffold {
        path: dir.display().to_string(),
        reason: err.to_string(),
    })?;
    info!(dir = %dir.display(), "created migrations directory");
    Ok(true)
}

/// Write a new migration stub with the next version in `dir`.
///
/// The existing graph is loaded and validated first, so a stub is never
/// appended to a broken chain. Existing files are never overwritten.
///
/// # Errors
/// Returns [`EngineError::InvalidLabel`] when `label` has no letters or
/// digits, [`EngineError::Load`] when the current graph is invalid, and
/// [`EngineError::Scaffold`] when the file cannot be written.
pub fn create_migration(
    dir: &Path,
    label: &str,
    scheme: VersionScheme,
    now: OffsetDateTime,
) -> Result<PathBuf, EngineError> {
    let slug = migration_slug(label);
    if slug.is_empty() {
        return Err(EngineError::InvalidLabel(label.to_string()));
    }

    let graph = MigrationGraph::load(dir, scheme)?;
    let version = graph.next_version(now);
    let file_name =
        format!("{}_{slug}.{MIGRATION_FILE_EXTENSION}", format_file_version(version, scheme));
    let path = dir.join(file_name);

    let scaffold_error =
        |reason: String| EngineError::Scaffold { path: path.display().to_string(), reason };

    let created_at = now
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| scaffold_error(format!("failed to format timestamp: {err}")))?;
    let body = stub_body(version, label, &created_at);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|err| scaffold_error(err.to_string()))?;
    file.write_all(body.as_bytes()).map_err(|err| scaffold_error(err.to_string()))?;

    info!(path = %path.display(), version = %version, "created migration stub");
    Ok(path)
}

fn split_file_name(path: &Path) -> Result<Option<(Version, String)>, LoadError> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return Ok(None);
    };
    if file_name.starts_with('.') {
        return Ok(None);
    }
    let Some(stem) = file_name.strip_suffix(&format!(".{MIGRATION_FILE_EXTENSION}")) else {
        return Ok(None);
    };

    let Some((prefix, label)) = stem.split_once('_') else {
        return Err(LoadError::Malformed {
            path: path.display().to_string(),
            reason: format!("file name must be <version>_<label>.{MIGRATION_FILE_EXTENSION}"),
        });
    };

    let Some(version) = Version::parse(prefix) else {
        return Err(LoadError::GraphIntegrity(format!(
            "unsortable version `{prefix}` in {file_name}"
        )));
    };

    if label.is_empty() {
        return Err(LoadError::Malformed {
            path: path.display().to_string(),
            reason: "file name has an empty label".to_string(),
        });
    }

    Ok(Some((version, label.to_string())))
}

/// File-name form of a migration message: lowercase alphanumeric runs
/// joined by `_`. Empty when the message has no letters or digits.
#[must_use]
pub fn migration_slug(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for ch in label.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            slug.push(ch);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

fn format_file_version(version: Version, scheme: VersionScheme) -> String {
    match scheme {
        VersionScheme::Sequence => format!("{:0width$}", version.0, width = SEQUENCE_WIDTH),
        VersionScheme::Timestamp => version.to_string(),
    }
}

fn timestamp_version(now: OffsetDateTime) -> u64 {
    let utc = now.to_offset(UtcOffset::UTC);
    let year = u64::try_from(utc.year()).unwrap_or_default();
    let date = year * 10_000 + u64::from(u8::from(utc.month())) * 100 + u64::from(utc.day());
    let clock = u64::from(utc.hour()) * 10_000 + u64::from(utc.minute()) * 100 + u64::from(utc.second());
    date * 1_000_000 + clock
}

fn stub_body(version: Version, label: &str, created_at: &str) -> String {
    let title = label.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "-- message: {title}\n-- version: {version}\n-- created_at: {created_at}\n\n-- migrate:up\n\n\n-- migrate:down\n\n"
    )
}

fn io_error(path: &Path, err: &std::io::Error) -> LoadError {
    LoadError::Io { path: path.display().to_string(), reason: err.to_string() }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use time::macros::datetime;

    use super::*;

    const REVERSIBLE: &str = "-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 1;\n";

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
        fs::create_dir_all(&dir)
            .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
        dir
    }

    fn write_file(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body)
            .unwrap_or_else(|err| panic!("failed to write fixture {name}: {err}"));
    }

    fn fixture(version: u64, label: &str) -> Migration {
        let path = PathBuf::from(format!("{version:04}_{label}.sql"));
        match Migration::from_source(Version(version), label, REVERSIBLE, path) {
            Ok(migration) => migration,
            Err(err) => panic!("invalid fixture migration {version}: {err}"),
        }
    }

    fn three_step_graph() -> MigrationGraph {
        let migrations =
            vec![fixture(3, "create_orders"), fixture(1, "create_users"), fixture(2, "add_email_index")];
        match MigrationGraph::from_migrations(migrations, VersionScheme::Sequence) {
            Ok(graph) => graph,
            Err(err) => panic!("fixture graph should be valid: {err}"),
        }
    }

    #[test]
    fn load_sorts_and_ignores_unrelated_entries() -> Result<(), LoadError> {
        let dir = unique_temp_dir("migration-engine-graph-load");
        write_file(&dir, "0002_add_email_index.sql", REVERSIBLE);
        write_file(&dir, "0001_create_users.sql", REVERSIBLE);
        write_file(&dir, "0003_create_orders.sql", REVERSIBLE);
        write_file(&dir, "README.md", "not a migration");
        write_file(&dir, ".0004_hidden.sql", REVERSIBLE);
        fs::create_dir_all(dir.join("0005_subdir.sql"))
            .unwrap_or_else(|err| panic!("failed to create subdir: {err}"));

        let graph = MigrationGraph::load(&dir, VersionScheme::Sequence)?;
        let labels = graph.migrations().iter().map(|m| m.label.as_str()).collect::<Vec<_>>();

        assert_eq!(labels, vec!["create_users", "add_email_index", "create_orders"]);
        assert_eq!(graph.head(), VersionId::At(Version(3)));

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn duplicate_versions_fail_graph_integrity() {
        let dir = unique_temp_dir("migration-engine-graph-duplicate");
        write_file(&dir, "20240101_create_users.sql", REVERSIBLE);
        write_file(&dir, "20240101_create_orders.sql", REVERSIBLE);

        for scheme in [VersionScheme::Timestamp, VersionScheme::Sequence] {
            match MigrationGraph::load(&dir, scheme) {
                Err(LoadError::GraphIntegrity(message)) => {
                    assert!(message.contains("duplicate version 20240101"), "{message}");
                }
                other => panic!("expected duplicate version error, got {other:?}"),
            }
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn zero_padding_does_not_hide_duplicates() {
        let result = MigrationGraph::from_migrations(
            vec![fixture(1, "create_users"), {
                let mut again = fixture(1, "create_accounts");
                again.path = PathBuf::from("1_create_accounts.sql");
                again
            }],
            VersionScheme::Sequence,
        );
        assert!(matches!(result, Err(LoadError::GraphIntegrity(_))));
    }

    #[test]
    fn unsortable_version_prefix_fails_graph_integrity() {
        let dir = unique_temp_dir("migration-engine-graph-unsortable");
        write_file(&dir, "abc_create_users.sql", REVERSIBLE);

        match MigrationGraph::load(&dir, VersionScheme::Sequence) {
            Err(LoadError::GraphIntegrity(message)) => assert!(message.contains("`abc`")),
            other => panic!("expected unsortable version error, got {other:?}"),
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_name_without_label_is_malformed() {
        let dir = unique_temp_dir("migration-engine-graph-nolabel");
        write_file(&dir, "0001.sql", REVERSIBLE);

        let result = MigrationGraph::load(&dir, VersionScheme::Sequence);
        assert!(matches!(result, Err(LoadError::Malformed { .. })), "{result:?}");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sequence_scheme_rejects_gaps_but_timestamp_tolerates_them() {
        let gapped = || vec![fixture(1, "create_users"), fixture(3, "create_orders")];

        match MigrationGraph::from_migrations(gapped(), VersionScheme::Sequence) {
            Err(LoadError::GraphIntegrity(message)) => {
                assert!(message.contains("expected version 2"), "{message}");
            }
            other => panic!("expected sequence gap error, got {other:?}"),
        }

        assert!(MigrationGraph::from_migrations(gapped(), VersionScheme::Timestamp).is_ok());
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = std::env::temp_dir().join("migration-engine-graph-does-not-exist-7f3a");
        let result = MigrationGraph::load(&dir, VersionScheme::Sequence);
        assert!(matches!(result, Err(LoadError::Io { .. })), "{result:?}");
    }

    #[test]
    fn navigation_walks_the_linear_chain() {
        let graph = three_step_graph();
        let v = |n| VersionId::At(Version(n));

        assert_eq!(graph.base(), VersionId::Base);
        assert_eq!(graph.successor_of(VersionId::Base), Some(v(1)));
        assert_eq!(graph.successor_of(v(2)), Some(v(3)));
        assert_eq!(graph.successor_of(v(3)), None);
        assert_eq!(graph.predecessor_of(v(1)), Some(VersionId::Base));
        assert_eq!(graph.predecessor_of(VersionId::Base), None);
        assert_eq!(graph.predecessor_of(v(9)), None);
        assert_eq!(graph.position(v(3)), Some(3));
        assert!(!graph.contains(v(4)));
    }

    #[test]
    fn all_between_returns_slices_in_both_directions() {
        let graph = three_step_graph();
        let versions = |slice: Option<Vec<&Migration>>| {
            slice.map(|migrations| migrations.iter().map(|m| m.version.0).collect::<Vec<_>>())
        };

        assert_eq!(versions(graph.all_between(VersionId::Base, VersionId::At(Version(2)))), Some(vec![1, 2]));
        assert_eq!(versions(graph.all_between(VersionId::At(Version(3)), VersionId::At(Version(1)))), Some(vec![3, 2]));
        assert_eq!(versions(graph.all_between(VersionId::At(Version(2)), VersionId::At(Version(2)))), Some(vec![]));
        assert_eq!(versions(graph.all_between(VersionId::Base, VersionId::At(Version(7)))), None);
    }

    #[test]
    fn create_migration_appends_next_sequence_version() -> Result<(), EngineError> {
        let dir = unique_temp_dir("migration-engine-graph-create");
        let now = datetime!(2024-01-01 12:30:45 UTC);

        let first = create_migration(&dir, "Create users", VersionScheme::Sequence, now)?;
        let second = create_migration(&dir, "add e-mail index!", VersionScheme::Sequence, now)?;

        assert_eq!(first.file_name().and_then(|n| n.to_str()), Some("0001_create_users.sql"));
        assert_eq!(second.file_name().and_then(|n| n.to_str()), Some("0002_add_e_mail_index.sql"));

        let graph = MigrationGraph::load(&dir, VersionScheme::Sequence)?;
        assert_eq!(graph.len(), 2);
        assert!(graph.migrations().iter().all(Migration::is_reversible));

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn create_migration_uses_utc_timestamps_and_stays_monotonic() -> Result<(), EngineError> {
        let dir = unique_temp_dir("migration-engine-graph-timestamp");
        let now = datetime!(2024-03-05 07:08:09 +02:00);

        let first = create_migration(&dir, "create users", VersionScheme::Timestamp, now)?;
        let second = create_migration(&dir, "create orders", VersionScheme::Timestamp, now)?;

        assert_eq!(first.file_name().and_then(|n| n.to_str()), Some("20240305050809_create_users.sql"));
        assert_eq!(second.file_name().and_then(|n| n.to_str()), Some("20240305050810_create_orders.sql"));

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn create_migration_rejects_labels_without_alphanumerics() {
        let dir = unique_temp_dir("migration-engine-graph-badlabel");
        let now = datetime!(2024-01-01 0:00 UTC);

        for label in ["", "   ", "!!!"] {
            let result = create_migration(&dir, label, VersionScheme::Sequence, now);
            assert!(matches!(result, Err(EngineError::InvalidLabel(_))), "{label:?}: {result:?}");
        }
        let entries = fs::read_dir(&dir).map(Iterator::count).unwrap_or(usize::MAX);
        assert_eq!(entries, 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn migration_slug_collapses_punctuation_runs() {
        assert_eq!(migration_slug("Add users table"), "add_users_table");
        assert_eq!(migration_slug("  --drop  old--index!! "), "drop_old_index");
        assert_eq!(migration_slug("!!!"), "");
    }

    #[test]
    fn init_migrations_dir_is_idempotent() -> Result<(), EngineError> {
        let root = unique_temp_dir("migration-engine-graph-init");
        let dir = root.join("migrations");

        assert!(init_migrations_dir(&dir)?);
        assert!(!init_migrations_dir(&dir)?);
        assert!(dir.is_dir());

        let _ = fs::remove_dir_all(&root);
        Ok(())
    }
}
