use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

mod graph;
mod plan;

pub use graph::{
    create_migration, init_migrations_dir, migration_slug, MigrationGraph,
    MIGRATION_FILE_EXTENSION,
};
pub use plan::{
    history, plan, resolve_target, HistoryEntry, MigrationStatus, Plan, Step, Target,
};

/// Textual form of [`VersionId::Base`], shared by the version store and the CLI.
pub const BASE_SENTINEL: &str = "base";

const DIRECTIVE_PREFIX: &str = "migrate:";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LoadError {
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("graph integrity error: {0}")]
    GraphIntegrity(String),
    #[error("malformed migration {path}: {reason}")]
    Malformed { path: String, reason: String },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("no migrations exist; there is nothing beyond base")]
    EmptyGraph,
    #[error("unknown target `{0}`: not in the migration graph")]
    UnknownTarget(String),
    #[error("version store is at {0}, which has no migration file")]
    CurrentNotInGraph(VersionId),
    #[error("migration {version} ({label}) is irreversible; cannot downgrade past it")]
    Irreversible { version: Version, label: String },
    #[error("migration {version} ({label}) failed while running {direction}: {cause}")]
    MigrationFailed { version: Version, label: String, direction: Direction, cause: String },
    #[error("version store error: {0}")]
    StoreIo(String),
    #[error(
        "migration {version} ({label}) changed after it was applied: recorded checksum {recorded}, file checksum {found}"
    )]
    ChecksumMismatch { version: Version, label: String, recorded: String, found: String },
    #[error("cannot run {requested} from {from} to {to}: the target lies in the other direction")]
    DirectionMismatch { requested: Direction, from: VersionId, to: VersionId },
    #[error("invalid migration label `{0}`: it must contain at least one letter or digit")]
    InvalidLabel(String),
    #[error("cannot create {path}: {reason}")]
    Scaffold { path: String, reason: String },
    #[error("reset failed during {phase} phase: {source}")]
    ResetFailed {
        phase: ResetPhase,
        #[source]
        source: Box<EngineError>,
    },
}

/// Ordered migration identifier taken from the numeric prefix of a file name.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// Parse the decimal form of a version. Leading zeros are accepted, so
    /// `0001` and `1` name the same version.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        value.parse::<u64>().ok().map(Self)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position in the chain: either nothing applied, or a migration version.
///
/// `Base` orders before every `At`, which lets callers compare a migration's
/// version against the current one without consulting the graph.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum VersionId {
    Base,
    At(Version),
}

impl VersionId {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed == BASE_SENTINEL {
            return Some(Self::Base);
        }
        Version::parse(trimmed).map(Self::At)
    }

    #[must_use]
    pub fn version(self) -> Option<Version> {
        match self {
            Self::Base => None,
            Self::At(version) => Some(version),
        }
    }

    #[must_use]
    pub fn is_base(self) -> bool {
        matches!(self, Self::Base)
    }
}

impl From<Version> for VersionId {
    fn from(version: Version) -> Self {
        Self::At(version)
    }
}

impl Display for VersionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => f.write_str(BASE_SENTINEL),
            Self::At(version) => write!(f, "{version}"),
        }
    }
}

impl Serialize for VersionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VersionScheme {
    /// Versions are exactly `1, 2, 3, ...`; gaps are integrity errors.
    #[default]
    Sequence,
    /// Versions are `YYYYMMDDHHMMSS` UTC stamps; gaps are expected.
    Timestamp,
}

impl VersionScheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequence => "sequence",
            Self::Timestamp => "timestamp",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sequence" => Some(Self::Sequence),
            "timestamp" => Some(Self::Timestamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResetPhase {
    Downgrade,
    Upgrade,
}

impl ResetPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downgrade => "downgrade",
            Self::Upgrade => "upgrade",
        }
    }
}

impl Display for ResetPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inverse action of a migration. Irreversibility is declared explicitly in
/// the file with `-- migrate:irreversible`; it is never inferred.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reversibility {
    Reversible { down: String },
    Irreversible,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Migration {
    pub version: Version,
    pub label: String,
    pub up: String,
    pub reversibility: Reversibility,
    /// SHA-256 of the full file text, hex encoded.
    pub checksum: String,
    pub path: PathBuf,
}

impl Migration {
    /// Build a migration from the text of its file.
    ///
    /// # Errors
    /// Returns [`LoadError::Malformed`] when the label is empty or the
    /// `-- migrate:` sections are missing, repeated, or conflicting.
    pub fn from_source(
        version: Version,
        label: &str,
        source: &str,
        path: PathBuf,
    ) -> Result<Self, LoadError> {
        if label.trim().is_empty() {
            return Err(LoadError::Malformed {
                path: path.display().to_string(),
                reason: "migration label must be non-empty".to_string(),
            });
        }

        let (up, reversibility) = parse_sections(&path, source)?;

        Ok(Self {
            version,
            label: label.to_string(),
            up,
            reversibility,
            checksum: sha256_hex(source),
            path,
        })
    }

    #[must_use]
    pub fn is_reversible(&self) -> bool {
        matches!(self.reversibility, Reversibility::Reversible { .. })
    }

    #[must_use]
    pub fn down(&self) -> Option<&str> {
        match &self.reversibility {
            Reversibility::Reversible { down } => Some(down),
            Reversibility::Irreversible => None,
        }
    }

    /// SQL batch for one direction; `None` for the down side of an
    /// irreversible migration.
    #[must_use]
    pub fn action(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Up => Some(&self.up),
            Direction::Down => self.down(),
        }
    }
}

#[derive(Clone, Copy)]
enum Section {
    Header,
    Up,
    Down,
    Irreversible,
}

fn directive(line: &str) -> Option<&str> {
    let comment = line.trim().strip_prefix("--")?;
    comment.trim_start().strip_prefix(DIRECTIVE_PREFIX).map(str::trim)
}

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("--")
}

fn parse_sections(path: &Path, source: &str) -> Result<(String, Reversibility), LoadError> {
    let malformed =
        |reason: String| LoadError::Malformed { path: path.display().to_string(), reason };

    let mut section = Section::Header;
    let mut up_lines: Vec<&str> = Vec::new();
    let mut down_lines: Vec<&str> = Vec::new();
    let mut seen_up = false;
    let mut seen_down = false;
    let mut seen_irreversible = false;

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;

        if let Some(name) = directive(line) {
            section = match name {
                "up" if !seen_up => {
                    seen_up = true;
                    Section::Up
                }
                "down" if !seen_down && !seen_irreversible => {
                    seen_down = true;
                    Section::Down
                }
                "irreversible" if !seen_down && !seen_irreversible => {
                    seen_irreversible = true;
                    Section::Irreversible
                }
                "up" | "down" | "irreversible" => {
                    return Err(malformed(format!(
                        "line {line_no}: repeated or conflicting `-- migrate:{name}` directive"
                    )));
                }
                other => {
                    return Err(malformed(format!(
                        "line {line_no}: unknown directive `-- migrate:{other}`"
                    )));
                }
            };
            continue;
        }

        match section {
            Section::Header | Section::Irreversible => {
                if !is_comment_or_blank(line) {
                    let place = if matches!(section, Section::Header) {
                        "before the first `-- migrate:` directive"
                    } else {
                        "after `-- migrate:irreversible`"
                    };
                    return Err(malformed(format!("line {line_no}: statement {place}")));
                }
            }
            Section::Up => up_lines.push(line),
            Section::Down => down_lines.push(line),
        }
    }

    if !seen_up {
        return Err(malformed("missing `-- migrate:up` section".to_string()));
    }

    let reversibility = if seen_down {
        Reversibility::Reversible { down: join_body(&down_lines) }
    } else if seen_irreversible {
        Reversibility::Irreversible
    } else {
        return Err(malformed(
            "missing `-- migrate:down` section; declare `-- migrate:irreversible` to opt out of downgrades"
                .to_string(),
        ));
    };

    let up = join_body(&up_lines);
    let down = match &reversibility {
        Reversibility::Reversible { down } => down.as_str(),
        Reversibility::Irreversible => "",
    };
    for (name, body) in [("up", up.as_str()), ("down", down)] {
        if let Some(keyword) = transaction_control(body) {
            return Err(malformed(format!(
                "`{keyword}` in the {name} section; each step already runs in its own transaction"
            )));
        }
    }

    Ok((up, reversibility))
}

/// First statement in `body` that would open or close a transaction.
///
/// Statements are split on `;` outside quotes and comments. The `END` that
/// closes a `CREATE TRIGGER ... BEGIN ... END` body is not counted, and
/// neither is `ROLLBACK TO`, which only unwinds a savepoint.
fn transaction_control(body: &str) -> Option<String> {
    let mut in_trigger = false;
    for statement in split_statements(body) {
        let words = statement
            .split_whitespace()
            .take(3)
            .map(str::to_ascii_uppercase)
            .collect::<Vec<_>>();
        let Some(first) = words.first() else {
            continue;
        };

        if in_trigger {
            if first == "END" {
                in_trigger = false;
            }
            continue;
        }
        if first == "CREATE" && words.iter().skip(1).any(|word| word == "TRIGGER") {
            in_trigger = statement.to_ascii_uppercase().split_whitespace().any(|word| word == "BEGIN");
            continue;
        }

        match first.as_str() {
            "BEGIN" | "COMMIT" | "END" => return Some(first.clone()),
            "ROLLBACK" if !words.iter().any(|word| word == "TO") => {
                return Some(first.clone());
            }
            _ => {}
        }
    }
    None
}

fn split_statements(body: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' | '`' => {
                current.push(ch);
                for quoted in chars.by_ref() {
                    current.push(quoted);
                    if quoted == ch {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
                current.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for skipped in chars.by_ref() {
                    if previous == '*' && skipped == '/' {
                        break;
                    }
                    previous = skipped;
                }
                current.push(' ');
            }
            ';' => statements.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    statements.push(current);
    statements.retain(|statement| !statement.trim().is_empty());
    statements
}

fn join_body(lines: &[&str]) -> String {
    lines.join("\n").trim().to_string()
}

fn sha256_hex(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}
