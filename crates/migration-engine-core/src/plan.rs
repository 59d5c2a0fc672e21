use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use crate::{
    Direction, EngineError, Migration, MigrationGraph, Reversibility, Version, VersionId,
};

/// Requested destination, before it is resolved against the current version.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Target {
    Head,
    Base,
    /// `+N` / `-N`: that many steps after or before the current version.
    Relative(i64),
    Version(Version),
}

impl FromStr for Target {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed {
            "head" => return Ok(Self::Head),
            "base" => return Ok(Self::Base),
            _ => {}
        }

        let relative = |digits: &str, sign: i64| {
            Version::parse(digits)
                .and_then(|steps| i64::try_from(steps.0).ok())
                .filter(|steps| *steps > 0)
                .map(|steps| Self::Relative(sign * steps))
        };

        let parsed = if let Some(digits) = trimmed.strip_prefix('+') {
            relative(digits, 1)
        } else if let Some(digits) = trimmed.strip_prefix('-') {
            relative(digits, -1)
        } else {
            Version::parse(trimmed).map(Self::Version)
        };

        parsed.ok_or_else(|| EngineError::UnknownTarget(value.to_string()))
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Head => f.write_str("head"),
            Self::Base => f.write_str("base"),
            Self::Relative(steps) if *steps >= 0 => write!(f, "+{steps}"),
            Self::Relative(steps) => write!(f, "{steps}"),
            Self::Version(version) => write!(f, "{version}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Step<'g> {
    pub migration: &'g Migration,
    pub direction: Direction,
    /// Version the store records once this step commits.
    pub resulting: VersionId,
}

impl<'g> Step<'g> {
    #[must_use]
    pub fn sql(&self) -> Option<&'g str> {
        self.migration.action(self.direction)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Plan<'g> {
    pub from: VersionId,
    pub to: VersionId,
    pub steps: Vec<Step<'g>>,
}

impl Plan<'_> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// `None` for an empty plan.
    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        self.steps.first().map(|step| step.direction)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Applied,
    Pending,
}

impl MigrationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HistoryEntry<'g> {
    pub migration: &'g Migration,
    pub status: MigrationStatus,
    pub is_current: bool,
}

/// Resolve a symbolic target against the current version.
///
/// # Errors
/// Returns [`EngineError::EmptyGraph`] when anything beyond base is
/// requested from an empty graph, [`EngineError::UnknownTarget`] for versions
/// not in the graph or relative moves past either end of the chain, and
/// [`EngineError::CurrentNotInGraph`] when a relative move starts from a
/// version the graph does not know.
pub fn resolve_target(
    graph: &MigrationGraph,
    current: VersionId,
    target: Target,
) -> Result<VersionId, EngineError> {
    match target {
        Target::Base => Ok(VersionId::Base),
        Target::Head if graph.is_empty() => Err(EngineError::EmptyGraph),
        Target::Head => Ok(graph.head()),
        Target::Version(_) if graph.is_empty() => Err(EngineError::EmptyGraph),
        Target::Version(version) => {
            let id = VersionId::At(version);
            if graph.contains(id) {
                Ok(id)
            } else {
                Err(EngineError::UnknownTarget(version.to_string()))
            }
        }
        Target::Relative(steps) => {
            if steps > 0 && graph.is_empty() {
                return Err(EngineError::EmptyGraph);
            }
            let position =
                graph.position(current).ok_or(EngineError::CurrentNotInGraph(current))?;
            let distance = usize::try_from(steps.unsigned_abs()).ok();
            let shifted = distance.and_then(|distance| {
                if steps >= 0 {
                    position.checked_add(distance)
                } else {
                    position.checked_sub(distance)
                }
            });

            shifted
                .and_then(|position| graph.at_position(position))
                .ok_or_else(|| EngineError::UnknownTarget(format!("{target} from {current}")))
        }
    }
}

/// Compute the ordered steps that move the chain from `current` to `target`.
///
/// Forward plans cover `(current, target]` ascending with `up` steps;
/// backward plans cover `(target, current]` descending with `down` steps.
/// Nothing is executed here.
///
/// # Errors
/// Returns [`EngineError::CurrentNotInGraph`] or
/// [`EngineError::UnknownTarget`] when an endpoint is not in the graph, and
/// [`EngineError::Irreversible`] when any `down` step would cross a migration
/// declared irreversible.
pub fn plan(
    graph: &MigrationGraph,
    current: VersionId,
    target: VersionId,
) -> Result<Plan<'_>, EngineError> {
    let from = graph.position(current).ok_or(EngineError::CurrentNotInGraph(current))?;
    let to = graph.position(target).ok_or_else(|| EngineError::UnknownTarget(target.to_string()))?;
    let direction = if from <= to { Direction::Up } else { Direction::Down };

    let migrations = graph
        .all_between(current, target)
        .ok_or_else(|| EngineError::UnknownTarget(target.to_string()))?;

    let mut steps = Vec::with_capacity(migrations.len());
    for migration in migrations {
        let resulting = match direction {
            Direction::Up => VersionId::At(migration.version),
            Direction::Down => {
                if let Reversibility::Irreversible = migration.reversibility {
                    return Err(EngineError::Irreversible {
                        version: migration.version,
                        label: migration.label.clone(),
                    });
                }
                graph.predecessor_of(VersionId::At(migration.version)).unwrap_or(VersionId::Base)
            }
        };
        steps.push(Step { migration, direction, resulting });
    }

    debug!(from = %current, to = %target, steps = steps.len(), "computed migration plan");
    Ok(Plan { from: current, to: target, steps })
}

/// Every migration in chain order, marked applied when its version is at or
/// before `current`.
#[must_use]
pub fn history(graph: &MigrationGraph, current: VersionId) -> Vec<HistoryEntry<'_>> {
    graph
        .migrations()
        .iter()
        .map(|migration| {
            let id = VersionId::At(migration.version);
            HistoryEntry {
                migration,
                status: if id <= current { MigrationStatus::Applied } else { MigrationStatus::Pending },
                is_current: id == current,
            }
        })
        .collect()
}
