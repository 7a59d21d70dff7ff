//! Wires the engine's services together for a single local process.

use std::sync::Arc;

use anyhow::Context;
use db::{DBService, models::repo::Repo, models::task::Task};
use executors::executors::CodingAgent;
use serde::Serialize;
use services::services::{
    acceptance::AcceptanceVerifier,
    audit::AuditLog,
    branches::BranchManager,
    config::{Config, load_config_from_file, save_config_to_file},
    context_digest::ContextDigest,
    cycles::CycleManager,
    git::GitService,
    permissions::PermissionGate,
    recovery::{IntegrityReport, MonitorSettings, RecoveryMonitor},
    tasks::TaskRegistry,
    worktree_manager::WorktreeManager,
};
use tokio::sync::RwLock;
use utils::assets::config_path;

/// What a fresh process found and repaired while starting.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub rules_seeded: usize,
    pub recoverable_tasks: Vec<Task>,
    pub orphaned_worktrees_removed: usize,
    pub integrity: IntegrityReport,
}

#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<RwLock<Config>>,
    db: DBService,
    audit: AuditLog,
    gate: PermissionGate,
    monitor: RecoveryMonitor,
    worktrees: WorktreeManager,
    tasks: TaskRegistry,
    cycles: CycleManager,
    branches: BranchManager,
    acceptance: AcceptanceVerifier,
    digest: ContextDigest,
}

impl LocalDeployment {
    /// Load the user's config and database from the asset directory and drive
    /// the configured Claude Code executable.
    pub async fn new() -> anyhow::Result<Self> {
        let config = load_config_from_file(&config_path()).await;
        let db = DBService::new().await.context("failed to open database")?;
        let agent: Arc<dyn CodingAgent> = Arc::new(config.agent.clone());
        Self::from_parts(config, db, agent)
    }

    pub fn from_parts(config: Config, db: DBService, agent: Arc<dyn CodingAgent>) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        let audit = AuditLog::new(db.clone());
        let gate = PermissionGate::new(db.clone(), audit.clone(), config.permission_timeout_secs);
        let monitor = RecoveryMonitor::new(audit.clone(), MonitorSettings::from(&config));
        let worktrees = WorktreeManager::new(
            GitService::new(),
            config.worktrees_root(),
            config.git_branch_prefix.clone(),
        );
        let tasks = TaskRegistry::new(
            db.clone(),
            audit.clone(),
            worktrees.clone(),
            gate.clone(),
            monitor.clone(),
            agent,
        );
        let cycles = CycleManager::new(db.clone(), audit.clone(), config.audit_frequency);
        let branches = BranchManager::new(db.clone());
        let acceptance = AcceptanceVerifier::new(db.clone());
        let digest = ContextDigest::new(db.clone(), audit.clone(), config.digest_token_budget);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            db,
            audit,
            gate,
            monitor,
            worktrees,
            tasks,
            cycles,
            branches,
            acceptance,
            digest,
        })
    }

    /// Seed permission rules, turn sessions orphaned by the previous process
    /// into interrupted tasks and reclaim worktrees no task refers to.
    pub async fn startup(&self) -> anyhow::Result<StartupReport> {
        let seed = self.config.read().await.permissions.clone();
        let rules_seeded = self.gate.seed_rules(&seed).await?;

        let recoverable_tasks = self.tasks.recover_after_restart().await?;
        if !recoverable_tasks.is_empty() {
            tracing::info!(count = recoverable_tasks.len(), "Tasks available for recovery");
        }

        let repos = Repo::find_all(&self.db.pool).await?;
        let active = self.tasks.active_worktrees().await?;
        let orphaned_worktrees_removed = self.worktrees.cleanup_orphans(&repos, &active).await;

        let integrity = self.monitor.integrity_check(&self.db.pool).await?;
        for issue in &integrity.issues {
            tracing::warn!("Integrity check: {}", issue);
        }

        Ok(StartupReport {
            rules_seeded,
            recoverable_tasks,
            orphaned_worktrees_removed,
            integrity,
        })
    }

    /// Stop every running session. Their tasks end up `interrupted` with the
    /// worktree kept, ready to resume after the next start.
    pub async fn shutdown(&self) {
        for task_id in self.tasks.running_tasks() {
            if let Err(e) = self.tasks.stop(task_id).await {
                tracing::warn!(%task_id, "Failed to stop task during shutdown: {}", e);
            }
        }
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Persist a new config. Changes to service settings apply on next start.
    pub async fn update_config(&self, config: Config) -> anyhow::Result<()> {
        save_config_to_file(&config, &config_path()).await?;
        *self.config.write().await = config;
        Ok(())
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn permissions(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn monitor(&self) -> &RecoveryMonitor {
        &self.monitor
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn cycles(&self) -> &CycleManager {
        &self.cycles
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    pub fn acceptance(&self) -> &AcceptanceVerifier {
        &self.acceptance
    }

    pub fn digest(&self) -> &ContextDigest {
        &self.digest
    }
}
