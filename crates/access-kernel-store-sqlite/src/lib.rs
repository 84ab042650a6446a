use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use access_kernel_core::{
    AssignmentId, AuditFilter, CallerContext, Context, ContextId, ContextScope, ContextSensitivity,
    ContextShare, OrgId, OwnerFields, PermissionLevel, PolicySnapshot, Predicate, Role,
    RoleAssignment, ScopeBinding, ShareId, ShareTarget, Team, TeamId, UserId,
};
use anyhow::{anyhow, Context as _, Result};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, OptionalExtension, Row, Transaction,
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod audit_log;
mod filter_sql;

pub use audit_log::{verify_export, ChainReport, ExportFileDigest, ExportManifest, GENESIS_HASH};

use filter_sql::to_sql;

const LATEST_SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS teams (
  team_id TEXT PRIMARY KEY,
  org_id TEXT,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contexts (
  context_id TEXT PRIMARY KEY,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  scope TEXT NOT NULL CHECK (scope IN ('personal','team','org')),
  owner_user_id TEXT,
  owner_team_id TEXT,
  owner_org_id TEXT,
  sensitivity_tier TEXT NOT NULL CHECK (sensitivity_tier IN ('public','internal','confidential','restricted')),
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  metadata_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (
    (scope = 'personal' AND owner_user_id IS NOT NULL AND owner_team_id IS NULL AND owner_org_id IS NULL)
    OR (scope = 'team' AND owner_user_id IS NULL AND owner_team_id IS NOT NULL AND owner_org_id IS NULL)
    OR (scope = 'org' AND owner_user_id IS NULL AND owner_team_id IS NULL AND owner_org_id IS NOT NULL)
  )
);

CREATE TABLE IF NOT EXISTS role_assignments (
  assignment_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('viewer','member','maintainer','admin','owner','system')),
  scope_type TEXT NOT NULL CHECK (scope_type IN ('global','org','team','context')),
  scope_id TEXT,
  granted_by TEXT NOT NULL,
  granted_at TEXT NOT NULL,
  expires_at TEXT,
  active INTEGER NOT NULL CHECK (active IN (0, 1)),
  revoked_at TEXT,
  revoked_by TEXT,
  CHECK ((scope_type = 'global' AND scope_id IS NULL) OR (scope_type <> 'global' AND scope_id IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS context_shares (
  share_id TEXT PRIMARY KEY,
  context_id TEXT NOT NULL,
  target_type TEXT NOT NULL CHECK (target_type IN ('user','team','org')),
  target_id TEXT NOT NULL,
  permission_level TEXT NOT NULL CHECK (permission_level IN ('read','write','admin')),
  message TEXT,
  expires_at TEXT,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  revoked_at TEXT,
  revoked_by TEXT,
  FOREIGN KEY (context_id) REFERENCES contexts(context_id)
);

CREATE TRIGGER IF NOT EXISTS context_shares_no_delete
BEFORE DELETE ON context_shares
BEGIN
  SELECT RAISE(ABORT, 'context_shares rows are never deleted; revoke instead');
END;

CREATE INDEX IF NOT EXISTS idx_contexts_owner_user ON contexts(owner_user_id);
CREATE INDEX IF NOT EXISTS idx_contexts_owner_team ON contexts(owner_team_id);
CREATE INDEX IF NOT EXISTS idx_contexts_owner_org ON contexts(owner_org_id);
CREATE INDEX IF NOT EXISTS idx_role_assignments_user ON role_assignments(user_id);
CREATE INDEX IF NOT EXISTS idx_role_assignments_scope ON role_assignments(scope_type, scope_id);
CREATE INDEX IF NOT EXISTS idx_context_shares_context ON context_shares(context_id);
CREATE INDEX IF NOT EXISTS idx_context_shares_target ON context_shares(target_type, target_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS permission_decisions (
  seq INTEGER PRIMARY KEY,
  decision_id TEXT NOT NULL UNIQUE,
  timestamp TEXT NOT NULL,
  caller_id TEXT NOT NULL,
  resource TEXT NOT NULL,
  action TEXT NOT NULL,
  resource_id TEXT,
  sensitivity_tier TEXT,
  decision TEXT NOT NULL CHECK (decision IN ('allow','deny')),
  reason TEXT,
  effective_role TEXT,
  scope_chain_json TEXT NOT NULL,
  retain_until TEXT NOT NULL,
  prev_hash TEXT NOT NULL,
  record_hash TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS permission_decisions_append_only
BEFORE UPDATE ON permission_decisions
BEGIN
  SELECT RAISE(ABORT, 'permission_decisions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS permission_decisions_retention
BEFORE DELETE ON permission_decisions
WHEN OLD.retain_until > strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
BEGIN
  SELECT RAISE(ABORT, 'permission_decisions row is still inside retention');
END;

CREATE INDEX IF NOT EXISTS idx_permission_decisions_caller ON permission_decisions(caller_id);
CREATE INDEX IF NOT EXISTS idx_permission_decisions_resource ON permission_decisions(resource, action);
";

// The append-only trigger is lifted only while existing rows are backfilled.
const MIGRATION_003_SQL: &str = r"
DROP TRIGGER IF EXISTS permission_decisions_append_only;
ALTER TABLE permission_decisions ADD COLUMN timestamp_ns INTEGER NOT NULL DEFAULT 0;
";

const MIGRATION_003_FINISH_SQL: &str = r"
CREATE TRIGGER IF NOT EXISTS permission_decisions_append_only
BEFORE UPDATE ON permission_decisions
BEGIN
  SELECT RAISE(ABORT, 'permission_decisions is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_permission_decisions_timestamp
  ON permission_decisions(timestamp_ns);
";

const CONTEXT_COLUMNS: &str = "context_id, name, scope, owner_user_id, owner_team_id, owner_org_id,
    sensitivity_tier, active, metadata_json, created_at, updated_at, deleted_at";

const ASSIGNMENT_COLUMNS: &str = "assignment_id, user_id, role, scope_type, scope_id, granted_by,
    granted_at, expires_at, active, revoked_at, revoked_by";

const SHARE_COLUMNS: &str = "share_id, context_id, target_type, target_id, permission_level,
    message, expires_at, created_by, created_at, revoked_at, revoked_by";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { busy_timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextQuery {
    pub scope: Option<ContextScope>,
    pub sensitivity_tier: Option<ContextSensitivity>,
    #[serde(default)]
    pub include_inactive: bool,
}

/// A move of a context to a new owner, applied in one transaction.
#[derive(Debug, Clone)]
pub struct OwnershipTransfer<'a> {
    pub context: &'a Context,
    pub previous_owner_user: Option<UserId>,
    pub new_owner_grant: Option<&'a RoleAssignment>,
    pub transferred_by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a `SQLite`-backed access store with default runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open the store with an explicit busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            options.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
        }
        if version < 3 {
            self.apply_migration_with(3, MIGRATION_003_SQL, |tx| {
                audit_log::backfill_timestamp_ns(tx)?;
                tx.execute_batch(MIGRATION_003_FINISH_SQL)
                    .context("failed to finish migration v3")
            })?;
        }
        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        self.apply_migration_with(version, sql, |_| Ok(()))
    }

    fn apply_migration_with(
        &mut self,
        version: i64,
        sql: &str,
        backfill: impl FnOnce(&Transaction<'_>) -> Result<()>,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        backfill(&tx)?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied access store migration");
        Ok(())
    }

    /// Persist a new context and, for personal contexts, its owner grant.
    ///
    /// # Errors
    /// Returns an error when the ownership invariant is violated or any write fails.
    pub fn insert_context(
        &mut self,
        context: &Context,
        owner_grant: Option<&RoleAssignment>,
    ) -> Result<()> {
        context.validate().map_err(|err| anyhow!("context validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            &format!(
                "INSERT INTO contexts({CONTEXT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                context.context_id.to_string(),
                context.name,
                context.scope.as_str(),
                context.owner.owner_user_id.map(|id| id.to_string()),
                context.owner.owner_team_id.map(|id| id.to_string()),
                context.owner.owner_org_id.map(|id| id.to_string()),
                context.sensitivity_tier.as_str(),
                context.active,
                serde_json::to_string(&context.metadata)
                    .context("failed to serialize context metadata")?,
                rfc3339(context.created_at)?,
                rfc3339(context.updated_at)?,
                context.deleted_at.map(rfc3339).transpose()?,
            ],
        )
        .context("failed to insert context")?;
        if let Some(grant) = owner_grant {
            insert_assignment_row(&tx, grant)?;
        }
        tx.commit().context("failed to commit context transaction")?;
        Ok(())
    }

    /// Load a live context without any visibility filter.
    ///
    /// Only for building a decision; rows handed back to callers go through
    /// [`SqliteStore::get_context`].
    ///
    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn context_for_decision(&self, context_id: ContextId) -> Result<Option<Context>> {
        self.get_context(context_id, &Predicate::All)
    }

    /// Load a live context visible under `filter`.
    ///
    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn get_context(
        &self,
        context_id: ContextId,
        filter: &Predicate,
    ) -> Result<Option<Context>> {
        let filter = to_sql(filter);
        let sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM contexts
             WHERE context_id = ? AND deleted_at IS NULL AND {}",
            filter.clause
        );
        let mut values = vec![Value::Text(context_id.to_string())];
        values.extend(filter.params);

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_context(row)?)),
            None => Ok(None),
        }
    }

    /// List live contexts visible under `filter`, newest first.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_contexts(&self, filter: &Predicate, query: &ContextQuery) -> Result<Vec<Context>> {
        let filter = to_sql(filter);
        let mut clauses = vec!["deleted_at IS NULL".to_string(), filter.clause];
        let mut values = filter.params;
        if let Some(scope) = query.scope {
            clauses.push("scope = ?".to_string());
            values.push(Value::Text(scope.as_str().to_string()));
        }
        if let Some(tier) = query.sensitivity_tier {
            clauses.push("sensitivity_tier = ?".to_string());
            values.push(Value::Text(tier.as_str().to_string()));
        }
        if !query.include_inactive {
            clauses.push("active = 1".to_string());
        }
        let sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM contexts WHERE {}
             ORDER BY created_at DESC, context_id ASC",
            clauses.join(" AND ")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut contexts = Vec::new();
        while let Some(row) = rows.next()? {
            contexts.push(decode_context(row)?);
        }
        Ok(contexts)
    }

    /// Write mutable fields of a context if it is still visible under `filter`.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    pub fn update_context(&mut self, context: &Context, filter: &Predicate) -> Result<bool> {
        let filter = to_sql(filter);
        let sql = format!(
            "UPDATE contexts
             SET name = ?, sensitivity_tier = ?, active = ?, metadata_json = ?, updated_at = ?
             WHERE context_id = ? AND deleted_at IS NULL AND {}",
            filter.clause
        );
        let mut values = vec![
            Value::Text(context.name.clone()),
            Value::Text(context.sensitivity_tier.as_str().to_string()),
            Value::Integer(i64::from(context.active)),
            Value::Text(
                serde_json::to_string(&context.metadata)
                    .context("failed to serialize context metadata")?,
            ),
            Value::Text(rfc3339(context.updated_at)?),
            Value::Text(context.context_id.to_string()),
        ];
        values.extend(filter.params);

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .context("failed to update context")?;
        Ok(changed == 1)
    }

    /// Soft-delete a context visible under `filter`.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    pub fn soft_delete_context(
        &mut self,
        context_id: ContextId,
        at: OffsetDateTime,
        filter: &Predicate,
    ) -> Result<bool> {
        let filter = to_sql(filter);
        let sql = format!(
            "UPDATE contexts SET deleted_at = ?, active = 0, updated_at = ?
             WHERE context_id = ? AND deleted_at IS NULL AND {}",
            filter.clause
        );
        let at = rfc3339(at)?;
        let mut values =
            vec![Value::Text(at.clone()), Value::Text(at), Value::Text(context_id.to_string())];
        values.extend(filter.params);

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values))
            .context("failed to soft-delete context")?;
        Ok(changed == 1)
    }

    /// Swap owner fields and owner grants of a context atomically.
    ///
    /// Returns `false` without writing anything when the context is not visible
    /// under `filter`.
    ///
    /// # Errors
    /// Returns an error when the new owner violates the ownership invariant or a write fails.
    pub fn transfer_context(
        &mut self,
        transfer: &OwnershipTransfer<'_>,
        filter: &Predicate,
    ) -> Result<bool> {
        let context = transfer.context;
        context.validate().map_err(|err| anyhow!("context validation failed: {err}"))?;
        let filter = to_sql(filter);
        let sql = format!(
            "UPDATE contexts
             SET scope = ?, owner_user_id = ?, owner_team_id = ?, owner_org_id = ?, updated_at = ?
             WHERE context_id = ? AND deleted_at IS NULL AND {}",
            filter.clause
        );
        let mut values = vec![
            Value::Text(context.scope.as_str().to_string()),
            optional_text(context.owner.owner_user_id),
            optional_text(context.owner.owner_team_id),
            optional_text(context.owner.owner_org_id),
            Value::Text(rfc3339(context.updated_at)?),
            Value::Text(context.context_id.to_string()),
        ];
        values.extend(filter.params);

        let tx = self.conn.transaction().context("failed to start transfer transaction")?;
        let changed = tx
            .execute(&sql, params_from_iter(values))
            .context("failed to update context owner")?;
        if changed != 1 {
            return Ok(false);
        }
        if let Some(previous) = transfer.previous_owner_user {
            tx.execute(
                "UPDATE role_assignments
                 SET active = 0, revoked_at = ?1, revoked_by = ?2
                 WHERE scope_type = 'context' AND scope_id = ?3 AND user_id = ?4
                   AND role = 'owner' AND revoked_at IS NULL",
                params![
                    rfc3339(context.updated_at)?,
                    transfer.transferred_by.to_string(),
                    context.context_id.to_string(),
                    previous.to_string(),
                ],
            )
            .context("failed to deactivate previous owner grant")?;
        }
        if let Some(grant) = transfer.new_owner_grant {
            insert_assignment_row(&tx, grant)?;
        }
        tx.commit().context("failed to commit transfer transaction")?;
        Ok(true)
    }

    /// Register a team in the directory.
    ///
    /// # Errors
    /// Returns an error when the team already exists or the insert fails.
    pub fn insert_team(&mut self, team: &Team) -> Result<()> {
        if team.name.trim().is_empty() {
            return Err(anyhow!("team name MUST be non-empty"));
        }
        self.conn
            .execute(
                "INSERT INTO teams(team_id, org_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    team.team_id.to_string(),
                    team.org_id.map(|id| id.to_string()),
                    team.name,
                    rfc3339(team.created_at)?,
                ],
            )
            .context("failed to insert team")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn get_team(&self, team_id: TeamId) -> Result<Option<Team>> {
        let mut stmt = self
            .conn
            .prepare("SELECT team_id, org_id, name, created_at FROM teams WHERE team_id = ?1")?;
        let mut rows = stmt.query(params![team_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_team(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the query or decoding fails.
    pub fn list_teams(&self) -> Result<Vec<Team>> {
        let mut stmt = self.conn.prepare(
            "SELECT team_id, org_id, name, created_at FROM teams ORDER BY team_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut teams = Vec::new();
        while let Some(row) = rows.next()? {
            teams.push(decode_team(row)?);
        }
        Ok(teams)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_assignment(&mut self, assignment: &RoleAssignment) -> Result<()> {
        insert_assignment_row(&self.conn, assignment)
    }

    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn get_assignment(&self, assignment_id: AssignmentId) -> Result<Option<RoleAssignment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM role_assignments WHERE assignment_id = ?1"
        ))?;
        let mut rows = stmt.query(params![assignment_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_assignment(row)?)),
            None => Ok(None),
        }
    }

    /// Soft-revoke an assignment. Returns `false` when it was already revoked.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn revoke_assignment(
        &mut self,
        assignment_id: AssignmentId,
        revoked_by: UserId,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE role_assignments SET active = 0, revoked_at = ?1, revoked_by = ?2
                 WHERE assignment_id = ?3 AND revoked_at IS NULL",
                params![rfc3339(at)?, revoked_by.to_string(), assignment_id.to_string()],
            )
            .context("failed to revoke role assignment")?;
        Ok(changed == 1)
    }

    /// All assignments bound exactly to `scope`, including revoked ones.
    ///
    /// # Errors
    /// Returns an error when the query or decoding fails.
    pub fn assignments_for_scope(&self, scope: ScopeBinding) -> Result<Vec<RoleAssignment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM role_assignments
             WHERE scope_type = ?1 AND scope_id IS ?2
             ORDER BY granted_at ASC, assignment_id ASC"
        ))?;
        let mut rows = stmt.query(params![scope.level().as_str(), scope.scope_id()])?;
        let mut assignments = Vec::new();
        while let Some(row) = rows.next()? {
            assignments.push(decode_assignment(row)?);
        }
        Ok(assignments)
    }

    /// # Errors
    /// Returns an error when the context does not exist or the insert fails.
    pub fn insert_share(&mut self, share: &ContextShare) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO context_shares({SHARE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    share.share_id.to_string(),
                    share.context_id.to_string(),
                    share.target.target_type(),
                    share.target.target_id(),
                    share.permission_level.as_str(),
                    share.message,
                    share.expires_at.map(rfc3339).transpose()?,
                    share.created_by.to_string(),
                    rfc3339(share.created_at)?,
                    share.revoked_at.map(rfc3339).transpose()?,
                    share.revoked_by.map(|id| id.to_string()),
                ],
            )
            .context("failed to insert context share")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup or decoding fails.
    pub fn get_share(&self, share_id: ShareId) -> Result<Option<ContextShare>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SHARE_COLUMNS} FROM context_shares WHERE share_id = ?1"))?;
        let mut rows = stmt.query(params![share_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_share(row)?)),
            None => Ok(None),
        }
    }

    /// Soft-revoke a share. Returns `false` when it was already revoked.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn revoke_share(
        &mut self,
        share_id: ShareId,
        revoked_by: UserId,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE context_shares SET revoked_at = ?1, revoked_by = ?2
                 WHERE share_id = ?3 AND revoked_at IS NULL",
                params![rfc3339(at)?, revoked_by.to_string(), share_id.to_string()],
            )
            .context("failed to revoke context share")?;
        Ok(changed == 1)
    }

    /// Every share of a context, including revoked and expired ones.
    ///
    /// # Errors
    /// Returns an error when the query or decoding fails.
    pub fn shares_for_context(&self, context_id: ContextId) -> Result<Vec<ContextShare>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SHARE_COLUMNS} FROM context_shares WHERE context_id = ?1
             ORDER BY created_at ASC, share_id ASC"
        ))?;
        let mut rows = stmt.query(params![context_id.to_string()])?;
        let mut shares = Vec::new();
        while let Some(row) = rows.next()? {
            shares.push(decode_share(row)?);
        }
        Ok(shares)
    }

    /// Read the caller's policy rows inside a single read transaction.
    ///
    /// Revoked shares are omitted; expired ones are kept so a denial can name them.
    ///
    /// # Errors
    /// Returns an error when any read fails.
    pub fn load_snapshot(&mut self, caller: &CallerContext) -> Result<PolicySnapshot> {
        let tx = self.conn.transaction().context("failed to start snapshot transaction")?;

        let assignments = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM role_assignments WHERE user_id = ?1
                 ORDER BY granted_at ASC, assignment_id ASC"
            ))?;
            let mut rows = stmt.query(params![caller.user_id.to_string()])?;
            let mut assignments = Vec::new();
            while let Some(row) = rows.next()? {
                assignments.push(decode_assignment(row)?);
            }
            assignments
        };

        let teams = {
            let mut stmt = tx.prepare(
                "SELECT team_id, org_id, name, created_at FROM teams ORDER BY team_id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut teams = Vec::new();
            while let Some(row) = rows.next()? {
                teams.push(decode_team(row)?);
            }
            teams
        };

        let mut team_ids = BTreeSet::new();
        let mut org_ids = BTreeSet::new();
        let bindings = caller
            .membership_grants()
            .map(|(_, binding)| binding)
            .chain(assignments.iter().map(|assignment| assignment.scope));
        for binding in bindings {
            match binding {
                ScopeBinding::Team(team_id) => {
                    team_ids.insert(team_id.to_string());
                }
                ScopeBinding::Org(org_id) => {
                    org_ids.insert(org_id.to_string());
                }
                ScopeBinding::Global | ScopeBinding::Context(_) => {}
            }
        }

        let shares = {
            let mut clauses = vec!["(target_type = 'user' AND target_id = ?)".to_string()];
            let mut values = vec![Value::Text(caller.user_id.to_string())];
            for (target_type, ids) in [("team", &team_ids), ("org", &org_ids)] {
                if ids.is_empty() {
                    continue;
                }
                clauses.push(format!(
                    "(target_type = '{target_type}' AND target_id IN ({}))",
                    vec!["?"; ids.len()].join(", ")
                ));
                values.extend(ids.iter().cloned().map(Value::Text));
            }
            let mut stmt = tx.prepare(&format!(
                "SELECT {SHARE_COLUMNS} FROM context_shares
                 WHERE revoked_at IS NULL AND ({})
                 ORDER BY created_at ASC, share_id ASC",
                clauses.join(" OR ")
            ))?;
            let mut rows = stmt.query(params_from_iter(values))?;
            let mut shares = Vec::new();
            while let Some(row) = rows.next()? {
                shares.push(decode_share(row)?);
            }
            shares
        };

        tx.commit().context("failed to close snapshot transaction")?;
        Ok(PolicySnapshot { assignments, shares, teams })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// Decisions in the live log that the backup does not hold are appended
    /// again, oldest first, on top of the restored chain. Returns how many.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, migrations
    /// fail, or the live decisions cannot be carried over.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<usize> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        let live = if has_table(&self.conn, "permission_decisions")? {
            self.find_decisions(&AuditFilter::default())?
        } else {
            Vec::new()
        };

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        let carried = self.carry_over_decisions(&live)?;
        tracing::info!(
            in_file = %in_file.display(),
            carried,
            "restored database and carried over live decisions"
        );
        Ok(carried)
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn insert_assignment_row(conn: &Connection, assignment: &RoleAssignment) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO role_assignments({ASSIGNMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            assignment.assignment_id.to_string(),
            assignment.user_id.to_string(),
            assignment.role.as_str(),
            assignment.scope.level().as_str(),
            assignment.scope.scope_id(),
            assignment.granted_by.to_string(),
            rfc3339(assignment.granted_at)?,
            assignment.expires_at.map(rfc3339).transpose()?,
            assignment.active,
            assignment.revoked_at.map(rfc3339).transpose()?,
            assignment.revoked_by.map(|id| id.to_string()),
        ],
    )
    .context("failed to insert role assignment")?;
    Ok(())
}

fn decode_context(row: &Row<'_>) -> Result<Context> {
    let scope_raw: String = row.get(2)?;
    let tier_raw: String = row.get(6)?;
    let metadata_json: String = row.get(8)?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata_json).context("failed to deserialize context metadata")?;

    Ok(Context {
        context_id: ContextId(parse_ulid(&row.get::<_, String>(0)?)?),
        name: row.get(1)?,
        scope: ContextScope::parse(&scope_raw)
            .ok_or_else(|| anyhow!("unknown context scope: {scope_raw}"))?,
        owner: OwnerFields {
            owner_user_id: parse_optional_ulid(row.get(3)?)?.map(UserId),
            owner_team_id: parse_optional_ulid(row.get(4)?)?.map(TeamId),
            owner_org_id: parse_optional_ulid(row.get(5)?)?.map(OrgId),
        },
        sensitivity_tier: ContextSensitivity::parse(&tier_raw)
            .ok_or_else(|| anyhow!("unknown sensitivity_tier: {tier_raw}"))?,
        active: row.get(7)?,
        metadata,
        created_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        deleted_at: parse_optional_rfc3339(row.get(11)?)?,
    })
}

fn decode_team(row: &Row<'_>) -> Result<Team> {
    Ok(Team {
        team_id: TeamId(parse_ulid(&row.get::<_, String>(0)?)?),
        org_id: parse_optional_ulid(row.get(1)?)?.map(OrgId),
        name: row.get(2)?,
        created_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
    })
}

fn decode_assignment(row: &Row<'_>) -> Result<RoleAssignment> {
    let role_raw: String = row.get(2)?;
    let scope_type: String = row.get(3)?;
    let scope_id: Option<String> = row.get(4)?;

    Ok(RoleAssignment {
        assignment_id: AssignmentId(parse_ulid(&row.get::<_, String>(0)?)?),
        user_id: UserId(parse_ulid(&row.get::<_, String>(1)?)?),
        role: Role::parse(&role_raw).ok_or_else(|| anyhow!("unknown role: {role_raw}"))?,
        scope: ScopeBinding::from_parts(&scope_type, scope_id.as_deref())?,
        granted_by: UserId(parse_ulid(&row.get::<_, String>(5)?)?),
        granted_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        expires_at: parse_optional_rfc3339(row.get(7)?)?,
        active: row.get(8)?,
        revoked_at: parse_optional_rfc3339(row.get(9)?)?,
        revoked_by: parse_optional_ulid(row.get(10)?)?.map(UserId),
    })
}

fn decode_share(row: &Row<'_>) -> Result<ContextShare> {
    let target_type: String = row.get(2)?;
    let target_id: String = row.get(3)?;
    let level_raw: String = row.get(4)?;

    Ok(ContextShare {
        share_id: ShareId(parse_ulid(&row.get::<_, String>(0)?)?),
        context_id: ContextId(parse_ulid(&row.get::<_, String>(1)?)?),
        target: ShareTarget::from_parts(&target_type, &target_id)?,
        permission_level: PermissionLevel::parse(&level_raw)
            .ok_or_else(|| anyhow!("unknown permission_level: {level_raw}"))?,
        message: row.get(5)?,
        expires_at: parse_optional_rfc3339(row.get(6)?)?,
        created_by: UserId(parse_ulid(&row.get::<_, String>(7)?)?),
        created_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        revoked_at: parse_optional_rfc3339(row.get(9)?)?,
        revoked_by: parse_optional_ulid(row.get(10)?)?.map(UserId),
    })
}

fn optional_text(value: Option<impl ToString>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.to_string()))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .context("failed to read current schema version")?;
    Ok(version.unwrap_or(0))
}

fn has_table(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![name],
        |row| row.get(0),
    )
    .with_context(|| format!("failed to look up table {name}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

pub(crate) fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of range: {value}"))
}

pub(crate) fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_optional_ulid(raw: Option<String>) -> Result<Option<Ulid>> {
    raw.as_deref().map(parse_ulid).transpose()
}
