use migration_engine_core::{
    history, plan, resolve_target, Direction, EngineError, HistoryEntry, MigrationGraph, Plan,
    ResetPhase, Step, Target, Version, VersionId,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{clear_applied, forget_applied, record_applied, store_io, write_current, SqliteStore};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppliedStep {
    pub version: Version,
    pub label: String,
    pub direction: Direction,
    pub resulting: VersionId,
}

impl From<&Step<'_>> for AppliedStep {
    fn from(step: &Step<'_>) -> Self {
        Self {
            version: step.migration.version,
            label: step.migration.label.clone(),
            direction: step.direction,
            resulting: step.resulting,
        }
    }
}

/// Outcome of a completed run. `steps` lists what committed, in order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunReport {
    pub from: VersionId,
    pub to: VersionId,
    pub steps: Vec<AppliedStep>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResetReport {
    pub downgrade: RunReport,
    pub upgrade: RunReport,
}

/// Executes plans against a store, one transaction per step.
///
/// A step's SQL, the new current version, and its ledger row commit
/// together. On the first failing step the run stops; the store keeps the
/// version of the last committed step.
pub struct Runner<'a> {
    store: &'a mut SqliteStore,
    graph: &'a MigrationGraph,
}

impl<'a> Runner<'a> {
    #[must_use]
    pub fn new(store: &'a mut SqliteStore, graph: &'a MigrationGraph) -> Self {
        Self { store, graph }
    }

    /// # Errors
    /// Returns [`EngineError::StoreIo`] when the version store cannot be read.
    pub fn current(&self) -> Result<VersionId, EngineError> {
        self.store.read_current()
    }

    /// # Errors
    /// Returns [`EngineError::StoreIo`] when the version store cannot be read.
    pub fn history(&self) -> Result<Vec<HistoryEntry<'a>>, EngineError> {
        let current = self.store.read_current()?;
        Ok(history(self.graph, current))
    }

    /// Resolve `target` and compute the plan without executing anything.
    ///
    /// # Errors
    /// Returns [`EngineError::ChecksumMismatch`] when an applied migration's
    /// file changed since it ran, plus every error of [`resolve_target`] and
    /// [`plan`].
    pub fn plan(&self, target: Target) -> Result<Plan<'a>, EngineError> {
        let current = self.store.read_current()?;
        self.verify_applied()?;
        let resolved = resolve_target(self.graph, current, target)?;
        plan(self.graph, current, resolved)
    }

    /// Move forward to `target`. An empty plan is a successful no-op.
    ///
    /// # Errors
    /// Returns [`EngineError::DirectionMismatch`] when `target` lies behind
    /// the current version, and [`EngineError::MigrationFailed`] for the first
    /// step whose SQL fails.
    pub fn upgrade(&mut self, target: Target) -> Result<RunReport, EngineError> {
        self.run(target, Some(Direction::Up))
    }

    /// Move backward to `target`.
    ///
    /// # Errors
    /// Returns [`EngineError::DirectionMismatch`] when `target` lies ahead of
    /// the current version, [`EngineError::Irreversible`] before anything runs
    /// when the plan crosses an irreversible migration, and
    /// [`EngineError::MigrationFailed`] for the first failing step.
    pub fn downgrade(&mut self, target: Target) -> Result<RunReport, EngineError> {
        self.run(target, Some(Direction::Down))
    }

    /// Downgrade to base, then upgrade to head.
    ///
    /// # Errors
    /// Returns [`EngineError::ResetFailed`] naming the phase that failed; the
    /// wrapped error carries the failing step.
    pub fn reset(&mut self) -> Result<ResetReport, EngineError> {
        let downgrade = self.run(Target::Base, Some(Direction::Down)).map_err(|source| {
            EngineError::ResetFailed { phase: ResetPhase::Downgrade, source: Box::new(source) }
        })?;

        let head = if self.graph.is_empty() { Target::Base } else { Target::Head };
        let upgrade = self.run(head, Some(Direction::Up)).map_err(|source| {
            EngineError::ResetFailed { phase: ResetPhase::Upgrade, source: Box::new(source) }
        })?;

        Ok(ResetReport { downgrade, upgrade })
    }

    /// Record `target` as current without running any migration SQL. The
    /// ledger is rewritten to the migrations at or before `target`, using
    /// their present checksums.
    ///
    /// # Errors
    /// Returns the errors of [`resolve_target`], and
    /// [`EngineError::StoreIo`] when the store cannot be written.
    pub fn stamp(&mut self, target: Target) -> Result<RunReport, EngineError> {
        let current = self.store.read_current()?;
        let resolved = resolve_target(self.graph, current, target)?;
        self.store.init()?;

        let tx = self
            .store
            .conn
            .transaction()
            .map_err(store_io("failed to open stamp transaction"))?;
        write_current(&tx, resolved)?;
        clear_applied(&tx)?;
        for migration in self.graph.migrations() {
            if VersionId::At(migration.version) <= resolved {
                record_applied(&tx, migration)?;
            }
        }
        tx.commit().map_err(store_io("failed to commit stamp transaction"))?;

        warn!(from = %current, to = %resolved, "stamped version store without running migrations");
        Ok(RunReport { from: current, to: resolved, steps: Vec::new() })
    }

    fn run(&mut self, target: Target, requested: Option<Direction>) -> Result<RunReport, EngineError> {
        let planned = self.plan(target)?;

        if let (Some(requested), Some(actual)) = (requested, planned.direction()) {
            if requested != actual {
                return Err(EngineError::DirectionMismatch {
                    requested,
                    from: planned.from,
                    to: planned.to,
                });
            }
        }

        if planned.is_empty() {
            info!(current = %planned.from, "already at target; nothing to run");
            return Ok(RunReport { from: planned.from, to: planned.to, steps: Vec::new() });
        }

        self.store.init()?;
        info!(from = %planned.from, to = %planned.to, steps = planned.len(), "running migration plan");

        let mut applied = Vec::with_capacity(planned.len());
        for step in &planned.steps {
            self.apply_step(step)?;
            applied.push(AppliedStep::from(step));
        }

        info!(current = %planned.to, steps = applied.len(), "migration plan complete");
        Ok(RunReport { from: planned.from, to: planned.to, steps: applied })
    }

    fn apply_step(&mut self, step: &Step<'_>) -> Result<(), EngineError> {
        let migration = step.migration;
        let Some(sql) = step.sql() else {
            return Err(EngineError::Irreversible {
                version: migration.version,
                label: migration.label.clone(),
            });
        };

        info!(
            version = %migration.version,
            label = %migration.label,
            direction = %step.direction,
            "applying migration"
        );

        let tx = self
            .store
            .conn
            .transaction()
            .map_err(store_io("failed to open migration transaction"))?;

        let executed = tx.execute_batch(sql);
        // A body that ends the step transaction itself has already committed
        // or discarded part of its work outside the version store's reach.
        let escaped = tx.is_autocommit();
        let cause = match (executed, escaped) {
            (Ok(()), false) => None,
            (Ok(()), true) => Some("the migration body ended the step transaction".to_string()),
            (Err(err), false) => Some(err.to_string()),
            (Err(err), true) => {
                Some(format!("{err} (after the migration body ended the step transaction)"))
            }
        };
        if let Some(cause) = cause {
            error!(
                version = %migration.version,
                label = %migration.label,
                direction = %step.direction,
                error = %cause,
                "migration failed; rolling back"
            );
            return Err(EngineError::MigrationFailed {
                version: migration.version,
                label: migration.label.clone(),
                direction: step.direction,
                cause,
            });
        }

        write_current(&tx, step.resulting)?;
        match step.direction {
            Direction::Up => record_applied(&tx, migration)?,
            Direction::Down => forget_applied(&tx, migration.version)?,
        }
        tx.commit().map_err(store_io("failed to commit migration transaction"))?;
        Ok(())
    }

    fn verify_applied(&self) -> Result<(), EngineError> {
        for record in self.store.applied_migrations()? {
            let Some(migration) = self.graph.get(record.version) else {
                continue;
            };
            if migration.checksum != record.checksum {
                return Err(EngineError::ChecksumMismatch {
                    version: record.version,
                    label: migration.label.clone(),
                    recorded: record.checksum,
                    found: migration.checksum.clone(),
                });
            }
        }
        Ok(())
    }
}
