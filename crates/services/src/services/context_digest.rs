use db::{
    DBService,
    models::{
        audit_event::{AuditEvent, AuditEventType},
        cycle::Cycle,
        learning::Learning,
        project::Project,
        task::{Task, TaskStatus},
    },
};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::services::audit::AuditLog;

const PLACEHOLDER: &str = "_none_";
const RECENT_LEARNINGS: i64 = 10;
const RECENT_DECISIONS: i64 = 10;
/// Below this the section headers alone would not fit.
pub const MIN_TOKEN_BUDGET: usize = 64;
const CHARS_PER_TOKEN: usize = 4;
const DECISION_TYPES: [AuditEventType; 2] = [
    AuditEventType::PermissionDecision,
    AuditEventType::TaskStatusChanged,
];

/// Rough token count used for budgeting: one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

struct Section {
    title: &'static str,
    lines: Vec<String>,
}

/// Bounded plain-text summary handed to a fresh agent context.
#[derive(Clone)]
pub struct ContextDigest {
    db: DBService,
    audit: AuditLog,
    budget: usize,
}

impl ContextDigest {
    pub fn new(db: DBService, audit: AuditLog, budget: usize) -> Self {
        Self { db, audit, budget }
    }

    pub async fn digest(&self, project_id: Uuid, current_task: Option<Uuid>) -> Result<String, sqlx::Error> {
        Self::generate(&self.db.pool, project_id, current_task, self.budget).await
    }

    /// Render the digest for a project. Every section is present; lines are
    /// dropped or shortened until the estimate fits `budget` (never less than
    /// [`MIN_TOKEN_BUDGET`]). Output only depends on stored state.
    pub async fn generate(
        pool: &SqlitePool,
        project_id: Uuid,
        current_task: Option<Uuid>,
        budget: usize,
    ) -> Result<String, sqlx::Error> {
        let project = Project::find_by_id(pool, project_id).await?;

        let mut goal = Vec::new();
        if let Some(project) = &project {
            goal.push(format!("Project: {}", project.name));
            if let Some(text) = project.goal.as_deref().filter(|g| !g.trim().is_empty()) {
                goal.extend(text.lines().filter(|l| !l.trim().is_empty()).map(str::to_string));
            }
        }

        let mut cycle_lines = Vec::new();
        if let Some(cycle) = Cycle::find_active_for_project(pool, project_id).await? {
            cycle_lines.push(format!("Cycle {}: {}", cycle.number, single_line(&cycle.goal)));
            let tasks = Task::find_by_cycle_id(pool, cycle.id).await?;
            if !tasks.is_empty() {
                let done = tasks.iter().filter(|t| t.status == TaskStatus::Done).count();
                cycle_lines.push(format!("Tasks: {done}/{} done", tasks.len()));
            }
        }

        let mut task_lines = Vec::new();
        let task = match current_task {
            Some(task_id) => Task::find_by_id(pool, task_id).await?,
            None => None,
        };
        if let Some(task) = task {
            task_lines.push(format!("{} [{}]", single_line(&task.title), task.status));
            if let Some(branch) = &task.branch_name {
                task_lines.push(format!("Branch: {branch}"));
            }
            if let Some(description) = &task.description {
                task_lines.extend(
                    description
                        .lines()
                        .filter(|l| !l.trim().is_empty())
                        .map(str::to_string),
                );
            }
        }

        let learnings = Learning::find_recent_for_project(pool, project_id, RECENT_LEARNINGS)
            .await?
            .into_iter()
            .map(|l| format!("- {}", single_line(&l.content)))
            .collect();

        let decisions =
            AuditEvent::find_recent_for_project(pool, project_id, &DECISION_TYPES, RECENT_DECISIONS)
                .await?
                .iter()
                .filter_map(describe_decision)
                .collect();

        let sections = vec![
            Section { title: "Goal", lines: goal },
            Section { title: "Active Cycle", lines: cycle_lines },
            Section { title: "Current Task", lines: task_lines },
            Section { title: "Recent Learnings", lines: learnings },
            Section { title: "Recent Decisions", lines: decisions },
        ];
        Ok(fit_to_budget(sections, budget.max(MIN_TOKEN_BUDGET)))
    }

    /// Log that the agent context was reset, carrying the digest it restarts from.
    pub async fn record_context_cleared(
        &self,
        project_id: Uuid,
        task_id: Option<Uuid>,
    ) -> Result<AuditEvent, sqlx::Error> {
        let digest = self.digest(project_id, task_id).await?;
        let event = self
            .audit
            .record(
                Some(project_id),
                task_id,
                AuditEventType::ContextClearedWithSummary,
                json!({
                    "summary": digest,
                    "estimated_tokens": estimate_tokens(&digest),
                    "budget": self.budget,
                }),
            )
            .await?;
        tracing::info!(project_id = %project_id, "Context cleared with summary");
        Ok(event)
    }
}

fn describe_decision(event: &AuditEvent) -> Option<String> {
    let details = event.details_json();
    let when = event.created_at.format("%Y-%m-%d %H:%M");
    match event.event_type {
        AuditEventType::PermissionDecision => {
            let signature = details.get("signature")?.as_str()?;
            let status = match details.get("status")? {
                Value::String(s) => s.as_str(),
                other => other.get("status").and_then(Value::as_str).unwrap_or("unknown"),
            };
            Some(format!("- {when} permission {status}: {}", single_line(signature)))
        }
        AuditEventType::TaskStatusChanged => {
            let from = details.get("from")?.as_str()?;
            let to = details.get("to")?.as_str()?;
            let task = event.task_id.map(|id| utils::text::short_uuid(&id)).unwrap_or_default();
            Some(format!("- {when} task {task}: {from} -> {to}"))
        }
        _ => None,
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| {
            let body = if s.lines.is_empty() {
                PLACEHOLDER.to_string()
            } else {
                s.lines.join("\n")
            };
            format!("# {}\n{}\n", s.title, body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fill sections in order, line by line, while the rendering stays within
/// `budget` tokens. A first line that does not fit whole is shortened.
fn fit_to_budget(sections: Vec<Section>, budget: usize) -> String {
    let mut kept: Vec<Section> = sections
        .iter()
        .map(|s| Section { title: s.title, lines: Vec::new() })
        .collect();

    for (i, section) in sections.into_iter().enumerate() {
        for line in section.lines {
            kept[i].lines.push(line);
            let over = estimate_tokens(&render(&kept)).saturating_sub(budget);
            if over == 0 {
                continue;
            }
            let Some(line) = kept[i].lines.pop() else { break };
            if kept[i].lines.is_empty() {
                let keep = line.chars().count().saturating_sub(over * CHARS_PER_TOKEN + 1);
                if keep >= 16 {
                    let shortened: String = line.chars().take(keep).collect::<String>() + "…";
                    kept[i].lines.push(shortened);
                    if estimate_tokens(&render(&kept)) > budget {
                        kept[i].lines.clear();
                    }
                }
            }
            break;
        }
    }
    render(&kept)
}

#[cfg(test)]
mod tests {
    use db::models::{
        learning::{CreateLearning, LearningSource},
        project::CreateProject,
        task::CreateTask,
    };

    use super::*;

    const TITLES: [&str; 5] = [
        "# Goal",
        "# Active Cycle",
        "# Current Task",
        "# Recent Learnings",
        "# Recent Decisions",
    ];

    async fn project(db: &DBService) -> Project {
        Project::create(
            &db.pool,
            &CreateProject {
                name: "digest".into(),
                goal: Some("Ship a reliable task engine".into()),
                agent_config: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn empty_project_has_every_section() {
        let db = DBService::new_in_memory().await.unwrap();
        let digest = ContextDigest::generate(&db.pool, Uuid::new_v4(), None, 2000).await.unwrap();
        for title in TITLES {
            assert!(digest.contains(title), "missing {title}");
        }
        assert_eq!(digest.matches(PLACEHOLDER).count(), 5);
    }

    #[tokio::test]
    async fn digest_reflects_project_state_and_is_deterministic() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = project(&db).await;
        let cycle = Cycle::create_next(&db.pool, project.id, "harden recovery").await.unwrap();
        let task = Task::create(
            &db.pool,
            &CreateTask {
                cycle_id: Some(cycle.id),
                description: Some("Detect loops early".into()),
                ..CreateTask::from_title(project.id, "Loop detector")
            },
            Uuid::new_v4(),
        )
        .await
        .unwrap();
        Learning::create(
            &db.pool,
            &CreateLearning {
                project_id: project.id,
                cycle_id: Some(cycle.id),
                task_id: None,
                content: "small diffs review faster".into(),
                source: LearningSource::Manual,
            },
        )
        .await
        .unwrap();
        AuditLog::new(db.clone())
            .record(
                Some(project.id),
                Some(task.id),
                AuditEventType::TaskStatusChanged,
                json!({ "from": "todo", "to": "in_progress" }),
            )
            .await
            .unwrap();

        let a = ContextDigest::generate(&db.pool, project.id, Some(task.id), 2000).await.unwrap();
        let b = ContextDigest::generate(&db.pool, project.id, Some(task.id), 2000).await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("Ship a reliable task engine"));
        assert!(a.contains("Cycle 0: harden recovery"));
        assert!(a.contains("Loop detector [todo]"));
        assert!(a.contains("- small diffs review faster"));
        assert!(a.contains("todo -> in_progress"));
    }

    #[tokio::test]
    async fn large_state_is_trimmed_to_budget() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = project(&db).await;
        for i in 0..10 {
            Learning::create(
                &db.pool,
                &CreateLearning {
                    project_id: project.id,
                    cycle_id: None,
                    task_id: None,
                    content: format!("learning {i}: {}", "x".repeat(400)),
                    source: LearningSource::Manual,
                },
            )
            .await
            .unwrap();
        }
        for budget in [MIN_TOKEN_BUDGET, 150, 500, 2000] {
            let digest = ContextDigest::generate(&db.pool, project.id, None, budget).await.unwrap();
            assert!(estimate_tokens(&digest) <= budget, "budget {budget} exceeded");
            for title in TITLES {
                assert!(digest.contains(title));
            }
        }
        let tiny = ContextDigest::generate(&db.pool, project.id, None, 1).await.unwrap();
        assert!(estimate_tokens(&tiny) <= MIN_TOKEN_BUDGET);
    }

    #[tokio::test]
    async fn clearing_context_is_audited() {
        let db = DBService::new_in_memory().await.unwrap();
        let project = project(&db).await;
        let audit = AuditLog::new(db.clone());
        let digest = ContextDigest::new(db.clone(), audit, 2000);
        let event = digest.record_context_cleared(project.id, None).await.unwrap();
        assert_eq!(event.event_type, AuditEventType::ContextClearedWithSummary);
        assert!(
            event.details_json()["summary"]
                .as_str()
                .unwrap()
                .contains("# Goal")
        );
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
