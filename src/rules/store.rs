//! SQLite-backed rule storage
//!
//! Durable storage for rules, version history, scope assignments,
//! dependencies, templates, evaluation analytics and recorded conflicts.
//! Every write increments the rule version and appends a version row in
//! the same transaction. Change events are broadcast best-effort through
//! the awareness publisher, and an optional semantic indexer receives a
//! document per rule on create/update.

use chrono::{DateTime, Duration, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::awareness::{AwarenessPublisher, RuleChangeEvent};
use crate::core::error::{EngineError, Result};

use super::model::{
    ConflictResolution, DependencyType, Rule, RuleAssignment, RuleChangeType, RuleDependency,
    RulePriority, RuleScope, RuleStatus, RuleTemplate, RuleVersion, TemplateParameter,
};
use super::templates;

/// Receives a searchable document per rule on create/update.
/// The indexing backend is external; failures must be swallowed by the
/// implementation.
pub trait SemanticIndexer: Send + Sync {
    /// Index one rule document
    fn index(&self, id: &str, document: &str, metadata: &Value);
}

/// Export/import serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// YAML document
    Yaml,
    /// JSON document
    Json,
}

impl FromStr for ExportFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            other => Err(EngineError::rule_validation(format!(
                "Unknown export format: {}",
                other
            ))),
        }
    }
}

/// Top-level export envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportEnvelope {
    /// When the export was produced
    pub export_timestamp: DateTime<Utc>,
    /// Envelope format version
    pub format_version: String,
    /// Exported rules
    pub rules: Vec<Rule>,
}

/// Aggregated evaluation analytics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAnalytics {
    /// Evaluations inside the window
    pub total_evaluations: u64,
    /// Mean evaluation time in milliseconds
    pub average_execution_time_ms: f64,
    /// Evaluations per agent
    pub agent_usage_patterns: HashMap<String, u64>,
    /// Evaluations per machine
    pub machine_usage_patterns: HashMap<String, u64>,
    /// Window size in days
    pub period_days: i64,
}

/// Rule counts by classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleStatistics {
    /// Total stored rules
    pub total_rules: u64,
    /// Counts by rule type
    pub by_type: HashMap<String, u64>,
    /// Counts by scope
    pub by_scope: HashMap<String, u64>,
    /// Counts by status
    pub by_status: HashMap<String, u64>,
    /// Stored templates
    pub total_templates: u64,
}

type DbConnection = PooledConnection<SqliteConnectionManager>;

/// SQLite-backed rule store
pub struct RuleStore {
    pool: Pool<SqliteConnectionManager>,
    publisher: Arc<AwarenessPublisher>,
    indexer: Option<Arc<dyn SemanticIndexer>>,
    source_machine: String,
}

impl RuleStore {
    /// Open (or create) a rule store at the given path
    pub fn open(
        path: impl AsRef<Path>,
        publisher: Arc<AwarenessPublisher>,
        source_machine: impl Into<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(8).build(manager)?;

        let store = Self {
            pool,
            publisher,
            indexer: None,
            source_machine: source_machine.into(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Attach a semantic indexer receiving rule documents on writes
    pub fn with_indexer(mut self, indexer: Arc<dyn SemanticIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    fn conn(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                scope TEXT NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                conditions TEXT NOT NULL DEFAULT '[]',
                actions TEXT NOT NULL DEFAULT '[]',
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                version INTEGER DEFAULT 1,
                parent_rule_id TEXT,
                conflict_resolution TEXT DEFAULT 'highest_priority',
                effective_from TEXT,
                effective_until TEXT,
                metadata TEXT DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS rule_versions (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                change_type TEXT NOT NULL,
                rule_data TEXT NOT NULL,
                changed_by TEXT NOT NULL,
                changed_at TEXT NOT NULL,
                change_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS rule_assignments (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                scope_type TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                priority_override INTEGER,
                effective_from TEXT,
                effective_until TEXT,
                metadata TEXT DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE(rule_id, scope_type, scope_id)
            );

            CREATE TABLE IF NOT EXISTS rule_dependencies (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                depends_on_rule_id TEXT NOT NULL,
                dependency_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                metadata TEXT DEFAULT '{}',
                UNIQUE(rule_id, depends_on_rule_id, dependency_type)
            );

            CREATE TABLE IF NOT EXISTS rule_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT '[]',
                template_data TEXT NOT NULL,
                category TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                metadata TEXT DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS rule_evaluations (
                id TEXT PRIMARY KEY,
                rule_ids TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                machine_id TEXT NOT NULL,
                evaluation_context TEXT NOT NULL,
                result TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rule_conflicts (
                id TEXT PRIMARY KEY,
                rule_ids TEXT NOT NULL,
                conflict_type TEXT NOT NULL,
                resolution_strategy TEXT NOT NULL,
                resolved_rule_id TEXT,
                context TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rules_type_scope ON rules (rule_type, scope);
            CREATE INDEX IF NOT EXISTS idx_rules_priority_status ON rules (priority, status);
            CREATE INDEX IF NOT EXISTS idx_rules_effective_dates ON rules (effective_from, effective_until);
            CREATE INDEX IF NOT EXISTS idx_assignments_scope ON rule_assignments (scope_type, scope_id);
            CREATE INDEX IF NOT EXISTS idx_versions_rule_version ON rule_versions (rule_id, version);
            CREATE INDEX IF NOT EXISTS idx_dependencies_rule ON rule_dependencies (rule_id);
            CREATE INDEX IF NOT EXISTS idx_evaluations_agent ON rule_evaluations (agent_id);
            "#,
        )?;
        Ok(())
    }

    // Rule CRUD

    /// Create a rule. Assigns an id when empty, resets history to the
    /// rule's version and appends the creation version row atomically.
    pub fn create_rule(&self, rule: &mut Rule, change_reason: Option<&str>) -> Result<String> {
        self.create_rule_with_change(rule, change_reason, RuleChangeType::Created)
    }

    fn create_rule_with_change(
        &self,
        rule: &mut Rule,
        change_reason: Option<&str>,
        change_type: RuleChangeType,
    ) -> Result<String> {
        if rule.id.is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }
        let rule_data = serde_json::to_value(&*rule)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT INTO rules
               (id, name, description, rule_type, scope, priority, status, conditions, actions,
                tags, created_at, created_by, updated_at, updated_by, version, parent_rule_id,
                conflict_resolution, effective_from, effective_until, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"#,
            params![
                rule.id,
                rule.name,
                rule.description,
                rule.rule_type.to_string(),
                rule.scope.to_string(),
                rule.priority.value(),
                rule.status.to_string(),
                serde_json::to_string(&rule.conditions)?,
                serde_json::to_string(&rule.actions)?,
                serde_json::to_string(&rule.tags)?,
                rule.created_at.to_rfc3339(),
                rule.created_by,
                rule.updated_at.to_rfc3339(),
                rule.updated_by,
                rule.version,
                rule.parent_rule_id,
                rule.conflict_resolution.to_string(),
                rule.effective_from.map(|t| t.to_rfc3339()),
                rule.effective_until.map(|t| t.to_rfc3339()),
                serde_json::to_string(&rule.metadata)?,
            ],
        )?;
        insert_version_row(
            &tx,
            &rule.id,
            rule.version,
            change_type,
            &rule_data,
            &rule.created_by,
            change_reason,
        )?;
        tx.commit()?;

        self.index_rule(rule);
        self.notify_change(&rule.id, change_type, rule_data);
        Ok(rule.id.clone())
    }

    /// Update a rule. Increments the stored version and appends the
    /// update version row atomically. Returns false when the rule does
    /// not exist.
    pub fn update_rule(&self, rule: &mut Rule, change_reason: Option<&str>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row("SELECT version FROM rules WHERE id = ?1", [&rule.id], |r| {
                r.get(0)
            })
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };

        rule.version = current + 1;
        rule.updated_at = Utc::now();
        let rule_data = serde_json::to_value(&*rule)?;

        tx.execute(
            r#"UPDATE rules SET
               name = ?1, description = ?2, rule_type = ?3, scope = ?4, priority = ?5,
               status = ?6, conditions = ?7, actions = ?8, tags = ?9, updated_at = ?10,
               updated_by = ?11, version = ?12, parent_rule_id = ?13, conflict_resolution = ?14,
               effective_from = ?15, effective_until = ?16, metadata = ?17
               WHERE id = ?18"#,
            params![
                rule.name,
                rule.description,
                rule.rule_type.to_string(),
                rule.scope.to_string(),
                rule.priority.value(),
                rule.status.to_string(),
                serde_json::to_string(&rule.conditions)?,
                serde_json::to_string(&rule.actions)?,
                serde_json::to_string(&rule.tags)?,
                rule.updated_at.to_rfc3339(),
                rule.updated_by,
                rule.version,
                rule.parent_rule_id,
                rule.conflict_resolution.to_string(),
                rule.effective_from.map(|t| t.to_rfc3339()),
                rule.effective_until.map(|t| t.to_rfc3339()),
                serde_json::to_string(&rule.metadata)?,
                rule.id,
            ],
        )?;
        insert_version_row(
            &tx,
            &rule.id,
            rule.version,
            RuleChangeType::Updated,
            &rule_data,
            &rule.updated_by,
            change_reason,
        )?;
        tx.commit()?;

        self.index_rule(rule);
        self.notify_change(&rule.id, RuleChangeType::Updated, rule_data);
        Ok(true)
    }

    /// Fetch one rule by id
    pub fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        let conn = self.conn()?;
        conn.query_row("SELECT * FROM rules WHERE id = ?1", [id], row_to_rule)
            .optional()
            .map_err(Into::into)
    }

    /// List every stored rule ordered by creation time
    pub fn list_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM rules ORDER BY created_at ASC")?;
        let rules = stmt
            .query_map([], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Active rules ordered by priority (desc) then creation time
    pub fn active_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM rules WHERE status = 'active' ORDER BY priority DESC, created_at ASC",
        )?;
        let rules = stmt
            .query_map([], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Active rules for one scope
    pub fn rules_by_scope(&self, scope: RuleScope) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM rules WHERE scope = ?1 AND status = 'active'
             ORDER BY priority DESC, created_at ASC",
        )?;
        let rules = stmt
            .query_map([scope.to_string()], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Activate a rule, optionally with an effective-from date
    pub fn activate_rule(
        &self,
        rule_id: &str,
        activated_by: &str,
        effective_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.change_status(
            rule_id,
            RuleStatus::Active,
            activated_by,
            RuleChangeType::Activated,
            effective_from,
            None,
        )
    }

    /// Deactivate a rule, optionally with an effective-until date
    pub fn deactivate_rule(
        &self,
        rule_id: &str,
        deactivated_by: &str,
        effective_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.change_status(
            rule_id,
            RuleStatus::Inactive,
            deactivated_by,
            RuleChangeType::Deactivated,
            None,
            effective_until,
        )
    }

    /// Mark a rule deprecated
    pub fn deprecate_rule(&self, rule_id: &str, deprecated_by: &str) -> Result<bool> {
        self.change_status(
            rule_id,
            RuleStatus::Deprecated,
            deprecated_by,
            RuleChangeType::Deprecated,
            None,
            None,
        )
    }

    fn change_status(
        &self,
        rule_id: &str,
        new_status: RuleStatus,
        changed_by: &str,
        change_type: RuleChangeType,
        effective_from: Option<DateTime<Utc>>,
        effective_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row("SELECT version FROM rules WHERE id = ?1", [rule_id], |r| {
                r.get(0)
            })
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };
        let new_version = current + 1;

        tx.execute(
            r#"UPDATE rules SET status = ?1, version = ?2, updated_at = ?3, updated_by = ?4,
               effective_from = COALESCE(?5, effective_from),
               effective_until = COALESCE(?6, effective_until)
               WHERE id = ?7"#,
            params![
                new_status.to_string(),
                new_version,
                Utc::now().to_rfc3339(),
                changed_by,
                effective_from.map(|t| t.to_rfc3339()),
                effective_until.map(|t| t.to_rfc3339()),
                rule_id,
            ],
        )?;
        let change_data = json!({
            "status": new_status.to_string(),
            "effective_from": effective_from,
            "effective_until": effective_until,
        });
        insert_version_row(
            &tx,
            rule_id,
            new_version,
            change_type,
            &change_data,
            changed_by,
            None,
        )?;
        tx.commit()?;

        self.notify_change(rule_id, change_type, change_data);
        Ok(true)
    }

    /// Delete a rule, recording the deletion in version history first
    pub fn delete_rule(&self, rule_id: &str, deleted_by: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row("SELECT version FROM rules WHERE id = ?1", [rule_id], |r| {
                r.get(0)
            })
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };

        insert_version_row(
            &tx,
            rule_id,
            current + 1,
            RuleChangeType::Deleted,
            &json!({"deleted": true}),
            deleted_by,
            None,
        )?;
        tx.execute("DELETE FROM rules WHERE id = ?1", [rule_id])?;
        tx.commit()?;

        self.notify_change(rule_id, RuleChangeType::Deleted, json!({"deleted": true}));
        Ok(true)
    }

    /// Version history for a rule, newest first
    pub fn version_history(&self, rule_id: &str) -> Result<Vec<RuleVersion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, version, change_type, rule_data, changed_by, changed_at,
                    change_reason
             FROM rule_versions WHERE rule_id = ?1 ORDER BY version DESC",
        )?;
        let versions = stmt
            .query_map([rule_id], |row| {
                Ok(RuleVersion {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    version: row.get(2)?,
                    change_type: parse_col(row, 3)?,
                    rule_data: parse_json(row, 4)?,
                    changed_by: row.get(5)?,
                    changed_at: parse_time(row, 6)?,
                    change_reason: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    // Dependencies

    /// Record a dependency relationship between two rules
    pub fn add_dependency(
        &self,
        rule_id: &str,
        depends_on_rule_id: &str,
        dependency_type: DependencyType,
        metadata: Option<Map<String, Value>>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO rule_dependencies
               (id, rule_id, depends_on_rule_id, dependency_type, created_at, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                id,
                rule_id,
                depends_on_rule_id,
                dependency_type.to_string(),
                Utc::now().to_rfc3339(),
                serde_json::to_string(&metadata.unwrap_or_default())?,
            ],
        )?;
        Ok(id)
    }

    /// Dependencies touching a rule, in either direction
    pub fn dependencies(&self, rule_id: &str) -> Result<Vec<RuleDependency>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, depends_on_rule_id, dependency_type, created_at, metadata
             FROM rule_dependencies
             WHERE rule_id = ?1 OR depends_on_rule_id = ?1 ORDER BY created_at ASC",
        )?;
        let deps = stmt
            .query_map([rule_id], |row| {
                Ok(RuleDependency {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    depends_on_rule_id: row.get(2)?,
                    dependency_type: parse_col(row, 3)?,
                    created_at: parse_time(row, 4)?,
                    metadata: parse_json_map(row, 5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(deps)
    }

    // Assignments

    /// Bind a rule to a concrete scope target. Re-assigning the same
    /// triple replaces the previous binding.
    pub fn assign_rule(
        &self,
        rule_id: &str,
        scope_type: RuleScope,
        scope_id: &str,
        priority_override: Option<i64>,
        effective_from: Option<DateTime<Utc>>,
        effective_until: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO rule_assignments
               (id, rule_id, scope_type, scope_id, priority_override, effective_from,
                effective_until, metadata, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8)"#,
            params![
                id,
                rule_id,
                scope_type.to_string(),
                scope_id,
                priority_override,
                effective_from.map(|t| t.to_rfc3339()),
                effective_until.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Assignments for one concrete scope target
    pub fn assignments_for_scope(
        &self,
        scope_type: RuleScope,
        scope_id: &str,
    ) -> Result<Vec<RuleAssignment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, scope_type, scope_id, priority_override, effective_from,
                    effective_until, metadata
             FROM rule_assignments WHERE scope_type = ?1 AND scope_id = ?2",
        )?;
        let assignments = stmt
            .query_map(params![scope_type.to_string(), scope_id], |row| {
                Ok(RuleAssignment {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    scope_type: parse_col(row, 2)?,
                    scope_id: row.get(3)?,
                    priority_override: row.get(4)?,
                    effective_from: parse_time_opt(row, 5)?,
                    effective_until: parse_time_opt(row, 6)?,
                    metadata: parse_json_map(row, 7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assignments)
    }

    // Export / import

    /// Export rules under the standard envelope
    pub fn export_rules(&self, format: ExportFormat, rule_ids: Option<&[String]>) -> Result<String> {
        let rules = match rule_ids {
            Some(ids) => {
                let mut selected = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(rule) = self.get_rule(id)? {
                        selected.push(rule);
                    }
                }
                selected
            }
            None => self.list_rules()?,
        };

        let envelope = ExportEnvelope {
            export_timestamp: Utc::now(),
            format_version: "1.0".to_string(),
            rules,
        };

        match format {
            ExportFormat::Yaml => Ok(serde_yaml::to_string(&envelope)?),
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&envelope)?),
        }
    }

    /// Import rules from an export envelope. Existing ids are skipped
    /// unless `overwrite` is set. Returns the imported rule ids.
    pub fn import_rules(
        &self,
        data: &str,
        format: ExportFormat,
        imported_by: &str,
        overwrite: bool,
    ) -> Result<Vec<String>> {
        let envelope: ExportEnvelope = match format {
            ExportFormat::Yaml => serde_yaml::from_str(data)?,
            ExportFormat::Json => serde_json::from_str(data)?,
        };

        let mut imported = Vec::new();
        for mut rule in envelope.rules {
            let existing = self.get_rule(&rule.id)?;
            match existing {
                Some(_) if !overwrite => {
                    warn!("Rule {} already exists, skipping import", rule.id);
                    continue;
                }
                Some(_) => {
                    rule.updated_by = imported_by.to_string();
                    self.update_rule(&mut rule, Some("Imported overwrite"))?;
                }
                None => {
                    self.create_rule_with_change(
                        &mut rule,
                        Some(&format!("Imported by {}", imported_by)),
                        RuleChangeType::Imported,
                    )?;
                }
            }
            imported.push(rule.id.clone());
        }
        Ok(imported)
    }

    // Templates

    /// Store a template. Fails on duplicate name.
    pub fn create_template(&self, template: &RuleTemplate) -> Result<String> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO rule_templates
               (id, name, description, rule_type, parameters, template_data, category, tags,
                created_by, created_at, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                template.id,
                template.name,
                template.description,
                template.rule_type.to_string(),
                serde_json::to_string(&template.parameters)?,
                serde_json::to_string(&template.template_data)?,
                template.category,
                serde_json::to_string(&template.tags)?,
                template.created_by,
                template.created_at.to_rfc3339(),
                serde_json::to_string(&template.metadata)?,
            ],
        )?;
        Ok(template.id.clone())
    }

    /// Fetch one template by id
    pub fn get_template(&self, id: &str) -> Result<Option<RuleTemplate>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM rule_templates WHERE id = ?1",
            [id],
            row_to_template,
        )
        .optional()
        .map_err(Into::into)
    }

    /// List templates, optionally restricted to a category
    pub fn list_templates(&self, category: Option<&str>) -> Result<Vec<RuleTemplate>> {
        let conn = self.conn()?;
        let mut stmt;
        let rows = match category {
            Some(category) => {
                stmt = conn.prepare(
                    "SELECT * FROM rule_templates WHERE category = ?1 ORDER BY name ASC",
                )?;
                stmt.query_map([category], row_to_template)?
            }
            None => {
                stmt = conn.prepare("SELECT * FROM rule_templates ORDER BY name ASC")?;
                stmt.query_map([], row_to_template)?
            }
        };
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Instantiate a template into a stored rule
    pub fn instantiate_template(
        &self,
        template_id: &str,
        parameters: &Map<String, Value>,
        created_by: &str,
    ) -> Result<Rule> {
        let template = self
            .get_template(template_id)?
            .ok_or_else(|| EngineError::TemplateNotFound {
                id: template_id.to_string(),
            })?;
        let mut rule = templates::instantiate(&template, parameters, created_by)?;
        self.create_rule(&mut rule, Some(&format!("From template {}", template_id)))?;
        Ok(rule)
    }

    /// Seed the built-in template library. Existing names are left alone.
    pub fn seed_default_templates(&self) -> Result<()> {
        for template in templates::default_templates() {
            let conn = self.conn()?;
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM rule_templates WHERE name = ?1",
                    [&template.name],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                self.create_template(&template)?;
            }
        }
        Ok(())
    }

    // Analytics

    /// Record one evaluation for analytics
    pub fn record_evaluation(
        &self,
        rule_ids: &[String],
        agent_id: &str,
        machine_id: &str,
        context: &Value,
        result: &Value,
        execution_time_ms: u64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO rule_evaluations
               (id, rule_ids, agent_id, machine_id, evaluation_context, result,
                execution_time_ms, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                Uuid::new_v4().to_string(),
                serde_json::to_string(rule_ids)?,
                agent_id,
                machine_id,
                serde_json::to_string(context)?,
                serde_json::to_string(result)?,
                execution_time_ms as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Aggregate evaluation analytics over a day window, optionally
    /// restricted to one rule id
    pub fn rule_analytics(&self, rule_id: Option<&str>, days: i64) -> Result<RuleAnalytics> {
        let cutoff = Utc::now() - Duration::days(days);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rule_ids, agent_id, machine_id, execution_time_ms, created_at
             FROM rule_evaluations",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut total = 0u64;
        let mut time_sum = 0i64;
        let mut agents: HashMap<String, u64> = HashMap::new();
        let mut machines: HashMap<String, u64> = HashMap::new();

        for row in rows {
            let (rule_ids, agent_id, machine_id, ms, created_at) = row?;
            let Ok(created_at) = DateTime::parse_from_rfc3339(&created_at) else {
                continue;
            };
            if created_at.with_timezone(&Utc) < cutoff {
                continue;
            }
            if let Some(rule_id) = rule_id {
                let ids: Vec<String> = serde_json::from_str(&rule_ids).unwrap_or_default();
                if !ids.iter().any(|id| id == rule_id) {
                    continue;
                }
            }
            total += 1;
            time_sum += ms;
            *agents.entry(agent_id).or_default() += 1;
            *machines.entry(machine_id).or_default() += 1;
        }

        Ok(RuleAnalytics {
            total_evaluations: total,
            average_execution_time_ms: if total > 0 {
                time_sum as f64 / total as f64
            } else {
                0.0
            },
            agent_usage_patterns: agents,
            machine_usage_patterns: machines,
            period_days: days,
        })
    }

    /// Contexts of recorded evaluations since a cutoff, optionally
    /// restricted to evaluations that applied a given rule
    pub fn evaluation_contexts(
        &self,
        rule_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT rule_ids, evaluation_context, created_at FROM rule_evaluations")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut contexts = Vec::new();
        for row in rows {
            let (rule_ids, context, created_at) = row?;
            let Ok(created_at) = DateTime::parse_from_rfc3339(&created_at) else {
                continue;
            };
            if created_at.with_timezone(&Utc) < since {
                continue;
            }
            if let Some(rule_id) = rule_id {
                let ids: Vec<String> = serde_json::from_str(&rule_ids).unwrap_or_default();
                if !ids.iter().any(|id| id == rule_id) {
                    continue;
                }
            }
            if let Ok(context) = serde_json::from_str(&context) {
                contexts.push(context);
            }
        }
        Ok(contexts)
    }

    /// Record a resolved conflict between rules
    pub fn record_conflict(
        &self,
        rule_ids: &[String],
        conflict_type: &str,
        resolution_strategy: ConflictResolution,
        resolved_rule_id: Option<&str>,
        context: &Value,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO rule_conflicts
               (id, rule_ids, conflict_type, resolution_strategy, resolved_rule_id, context,
                created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                Uuid::new_v4().to_string(),
                serde_json::to_string(rule_ids)?,
                conflict_type,
                resolution_strategy.to_string(),
                resolved_rule_id,
                serde_json::to_string(context)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Rule counts by type, scope and status
    pub fn statistics(&self) -> Result<RuleStatistics> {
        let conn = self.conn()?;
        let total_rules: u64 =
            conn.query_row("SELECT COUNT(*) FROM rules", [], |r| r.get::<_, i64>(0))? as u64;
        let total_templates: u64 = conn
            .query_row("SELECT COUNT(*) FROM rule_templates", [], |r| {
                r.get::<_, i64>(0)
            })? as u64;

        let mut by_type = HashMap::new();
        let mut stmt = conn.prepare("SELECT rule_type, COUNT(*) FROM rules GROUP BY rule_type")?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            let (key, count) = row?;
            by_type.insert(key, count as u64);
        }

        let mut by_scope = HashMap::new();
        let mut stmt = conn.prepare("SELECT scope, COUNT(*) FROM rules GROUP BY scope")?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            let (key, count) = row?;
            by_scope.insert(key, count as u64);
        }

        let mut by_status = HashMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM rules GROUP BY status")?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            let (key, count) = row?;
            by_status.insert(key, count as u64);
        }

        Ok(RuleStatistics {
            total_rules,
            by_type,
            by_scope,
            by_status,
            total_templates,
        })
    }

    fn index_rule(&self, rule: &Rule) {
        if let Some(indexer) = &self.indexer {
            let document = format!("{} {} {}", rule.name, rule.description, rule.tags.join(" "));
            let metadata = json!({
                "rule_id": rule.id,
                "rule_type": rule.rule_type.to_string(),
                "scope": rule.scope.to_string(),
                "priority": rule.priority.value(),
                "status": rule.status.to_string(),
            });
            indexer.index(&rule.id, &document, &metadata);
        }
    }

    fn notify_change(&self, rule_id: &str, change_type: RuleChangeType, rule_data: Value) {
        debug!("Rule {} {}", rule_id, change_type);
        self.publisher.emit(
            &format!("Rule {}: {}", change_type, rule_id),
            "rules",
            json!({"rule_id": rule_id, "change_type": change_type.to_string()}),
            &["rules", "change"],
        );
        self.publisher.broadcast_change(RuleChangeEvent {
            rule_id: rule_id.to_string(),
            change_type: change_type.to_string(),
            rule_data,
            timestamp: Utc::now(),
            source_machine: self.source_machine.clone(),
        });
    }
}

fn insert_version_row(
    tx: &rusqlite::Transaction<'_>,
    rule_id: &str,
    version: i64,
    change_type: RuleChangeType,
    rule_data: &Value,
    changed_by: &str,
    change_reason: Option<&str>,
) -> Result<()> {
    tx.execute(
        r#"INSERT INTO rule_versions
           (id, rule_id, version, change_type, rule_data, changed_by, changed_at, change_reason)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        params![
            Uuid::new_v4().to_string(),
            rule_id,
            version,
            change_type.to_string(),
            serde_json::to_string(rule_data)?,
            changed_by,
            Utc::now().to_rfc3339(),
            change_reason,
        ],
    )?;
    Ok(())
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        rule_type: parse_named(row, "rule_type")?,
        scope: parse_named(row, "scope")?,
        priority: {
            let value: i64 = row.get("priority")?;
            RulePriority::from_value(value).map_err(|e| invalid_column("priority", e))?
        },
        status: parse_named(row, "status")?,
        conditions: parse_json_named(row, "conditions")?,
        actions: parse_json_named(row, "actions")?,
        tags: parse_json_named(row, "tags")?,
        created_at: parse_time_named(row, "created_at")?,
        created_by: row.get("created_by")?,
        updated_at: parse_time_named(row, "updated_at")?,
        updated_by: row.get("updated_by")?,
        version: row.get("version")?,
        parent_rule_id: row.get("parent_rule_id")?,
        conflict_resolution: parse_named(row, "conflict_resolution")?,
        effective_from: parse_time_opt_named(row, "effective_from")?,
        effective_until: parse_time_opt_named(row, "effective_until")?,
        metadata: parse_json_named(row, "metadata")?,
    })
}

fn row_to_template(row: &Row<'_>) -> rusqlite::Result<RuleTemplate> {
    let parameters: Vec<TemplateParameter> = parse_json_named(row, "parameters")?;
    Ok(RuleTemplate {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        rule_type: parse_named(row, "rule_type")?,
        parameters,
        template_data: parse_json_named(row, "template_data")?,
        category: row.get("category")?,
        tags: parse_json_named(row, "tags")?,
        created_by: row.get("created_by")?,
        created_at: parse_time_named(row, "created_at")?,
        metadata: parse_json_named(row, "metadata")?,
    })
}

fn invalid_column(name: &str, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{}: {}", name, err).into(),
    )
}

fn parse_named<T: FromStr>(row: &Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(name)?;
    raw.parse().map_err(|e| invalid_column(name, e))
}

fn parse_col<T: FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| invalid_column("column", e))
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| invalid_column("json", e))
}

fn parse_json_named<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    name: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| invalid_column(name, e))
}

fn parse_json_map(row: &Row<'_>, idx: usize) -> rusqlite::Result<Map<String, Value>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| invalid_column("metadata", e)),
        None => Ok(Map::new()),
    }
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| invalid_column("timestamp", e))
}

fn parse_time_named(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| invalid_column(name, e))
}

fn parse_time_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| invalid_column("timestamp", e)),
        None => Ok(None),
    }
}

fn parse_time_opt_named(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(name)?;
    match raw {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| invalid_column(name, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{RuleAction, RuleActionType, RuleType};
    use tempfile::TempDir;

    fn store() -> (RuleStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RuleStore::open(
            dir.path().join("rules.db"),
            Arc::new(AwarenessPublisher::disabled()),
            "test-machine",
        )
        .unwrap();
        (store, dir)
    }

    fn sample_rule(name: &str) -> Rule {
        let mut rule = Rule::new(
            name,
            RuleType::Communication,
            RuleScope::Global,
            RulePriority::Normal,
            "tests",
        );
        rule.description = format!("{} description", name);
        rule.actions.push(RuleAction {
            action_type: RuleActionType::Set,
            target: "response_style".to_string(),
            value: json!("concise"),
            parameters: Map::new(),
        });
        rule
    }

    #[test]
    fn test_create_and_get_roundtrip() {
        let (store, _dir) = store();
        let mut rule = sample_rule("roundtrip");
        let id = store.create_rule(&mut rule, None).unwrap();

        let fetched = store.get_rule(&id).unwrap().unwrap();
        assert_eq!(fetched.name, "roundtrip");
        assert_eq!(fetched.version, 1);
        assert_eq!(fetched.actions, rule.actions);
        assert_eq!(fetched.priority, RulePriority::Normal);
    }

    #[test]
    fn test_update_increments_version_and_appends_history() {
        let (store, _dir) = store();
        let mut rule = sample_rule("versioned");
        store.create_rule(&mut rule, None).unwrap();

        rule.description = "second".to_string();
        assert!(store.update_rule(&mut rule, Some("tweak")).unwrap());
        assert_eq!(rule.version, 2);

        rule.description = "third".to_string();
        store.update_rule(&mut rule, None).unwrap();
        assert_eq!(rule.version, 3);

        let history = store.version_history(&rule.id).unwrap();
        assert_eq!(history.len(), 3);
        // Newest first; every write has a matching version row
        assert_eq!(history[0].version, 3);
        assert_eq!(history[2].version, 1);
        assert_eq!(history[2].change_type, RuleChangeType::Created);
    }

    #[test]
    fn test_status_changes_are_versioned() {
        let (store, _dir) = store();
        let mut rule = sample_rule("status");
        store.create_rule(&mut rule, None).unwrap();

        assert!(store.deactivate_rule(&rule.id, "tests", None).unwrap());
        let fetched = store.get_rule(&rule.id).unwrap().unwrap();
        assert_eq!(fetched.status, RuleStatus::Inactive);
        assert_eq!(fetched.version, 2);

        assert!(store.activate_rule(&rule.id, "tests", None).unwrap());
        let fetched = store.get_rule(&rule.id).unwrap().unwrap();
        assert_eq!(fetched.status, RuleStatus::Active);
        assert_eq!(fetched.version, 3);
    }

    #[test]
    fn test_active_rules_ordering() {
        let (store, _dir) = store();
        let mut low = sample_rule("low");
        low.priority = RulePriority::Low;
        let mut high = sample_rule("high");
        high.priority = RulePriority::High;
        store.create_rule(&mut low, None).unwrap();
        store.create_rule(&mut high, None).unwrap();

        let mut inactive = sample_rule("inactive");
        inactive.status = RuleStatus::Inactive;
        store.create_rule(&mut inactive, None).unwrap();

        let active = store.active_rules().unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].name, "high");
    }

    #[test]
    fn test_export_import_roundtrip() {
        let (source, _dir) = store();
        let mut a = sample_rule("export-a");
        let mut b = sample_rule("export-b");
        b.scope = RuleScope::Agent;
        source.create_rule(&mut a, None).unwrap();
        source.create_rule(&mut b, None).unwrap();

        let yaml = source.export_rules(ExportFormat::Yaml, None).unwrap();
        assert!(yaml.contains("format_version"));

        let (other, _dir2) = store();
        let imported = other
            .import_rules(&yaml, ExportFormat::Yaml, "importer", false)
            .unwrap();
        assert_eq!(imported.len(), 2);

        let restored = other.get_rule(&a.id).unwrap().unwrap();
        assert_eq!(restored.name, a.name);
        assert_eq!(restored.actions, a.actions);
        assert_eq!(restored.scope, a.scope);

        // Second import without overwrite skips everything
        let again = other
            .import_rules(&yaml, ExportFormat::Yaml, "importer", false)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_assignment_upsert() {
        let (store, _dir) = store();
        let mut rule = sample_rule("assigned");
        store.create_rule(&mut rule, None).unwrap();

        store
            .assign_rule(&rule.id, RuleScope::Agent, "agent-7", Some(900), None, None)
            .unwrap();
        store
            .assign_rule(&rule.id, RuleScope::Agent, "agent-7", Some(750), None, None)
            .unwrap();

        let assignments = store
            .assignments_for_scope(RuleScope::Agent, "agent-7")
            .unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].priority_override, Some(750));
    }

    #[test]
    fn test_dependencies_both_directions() {
        let (store, _dir) = store();
        let mut a = sample_rule("dep-a");
        let mut b = sample_rule("dep-b");
        store.create_rule(&mut a, None).unwrap();
        store.create_rule(&mut b, None).unwrap();

        store
            .add_dependency(&a.id, &b.id, DependencyType::Requires, None)
            .unwrap();

        let from_a = store.dependencies(&a.id).unwrap();
        let from_b = store.dependencies(&b.id).unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_a[0].dependency_type, DependencyType::Requires);

        // The triple is unique
        assert!(store
            .add_dependency(&a.id, &b.id, DependencyType::Requires, None)
            .is_err());
    }

    #[test]
    fn test_delete_rule_keeps_history() {
        let (store, _dir) = store();
        let mut rule = sample_rule("doomed");
        store.create_rule(&mut rule, None).unwrap();
        assert!(store.delete_rule(&rule.id, "tests").unwrap());
        assert!(store.get_rule(&rule.id).unwrap().is_none());

        let history = store.version_history(&rule.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].change_type, RuleChangeType::Deleted);
    }

    #[test]
    fn test_analytics_window() {
        let (store, _dir) = store();
        let ids = vec!["r1".to_string()];
        store
            .record_evaluation(&ids, "agent-1", "m1", &json!({}), &json!({}), 12)
            .unwrap();
        store
            .record_evaluation(&ids, "agent-2", "m1", &json!({}), &json!({}), 18)
            .unwrap();

        let analytics = store.rule_analytics(None, 7).unwrap();
        assert_eq!(analytics.total_evaluations, 2);
        assert_eq!(analytics.average_execution_time_ms, 15.0);
        assert_eq!(analytics.agent_usage_patterns["agent-1"], 1);

        let scoped = store.rule_analytics(Some("r1"), 7).unwrap();
        assert_eq!(scoped.total_evaluations, 2);
        let missing = store.rule_analytics(Some("zzz"), 7).unwrap();
        assert_eq!(missing.total_evaluations, 0);
    }

    #[test]
    fn test_statistics() {
        let (store, _dir) = store();
        let mut a = sample_rule("stat-a");
        let mut b = sample_rule("stat-b");
        b.rule_type = RuleType::Security;
        b.scope = RuleScope::Agent;
        store.create_rule(&mut a, None).unwrap();
        store.create_rule(&mut b, None).unwrap();

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_rules, 2);
        assert_eq!(stats.by_type["communication"], 1);
        assert_eq!(stats.by_type["security"], 1);
        assert_eq!(stats.by_scope["agent"], 1);
    }

    #[test]
    fn test_seed_default_templates_idempotent() {
        let (store, _dir) = store();
        store.seed_default_templates().unwrap();
        let first = store.list_templates(None).unwrap().len();
        assert!(first >= 3);
        store.seed_default_templates().unwrap();
        assert_eq!(store.list_templates(None).unwrap().len(), first);
    }
}
