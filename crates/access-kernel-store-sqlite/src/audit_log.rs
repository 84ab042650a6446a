//! Append-only, hash-chained decision log.
//!
//! Each row stores `record_hash = sha256("{seq}|{prev_hash}|{body_json}")` where
//! `body_json` is the canonical JSON of the [`PendingDecision`] rebuilt from the
//! row's own columns. Rewriting any column therefore breaks the chain at that row.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use access_kernel_core::{
    Action, AuditFilter, ContextSensitivity, DecisionId, DecisionOutcome, DenyReason,
    PendingDecision, PermissionDecision, Resource, Role, UserId,
};
use anyhow::{anyhow, Context as _, Result};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::{
    now_rfc3339, parse_rfc3339, parse_ulid, rfc3339, unix_nanos, SqliteStore,
    LATEST_SCHEMA_VERSION,
};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const DECISIONS_FILE: &str = "permission_decisions.ndjson";

const DECISION_COLUMNS: &str = "seq, decision_id, timestamp, caller_id, resource, action,
    resource_id, sensitivity_tier, decision, reason, effective_role, scope_chain_json,
    retain_until, prev_hash, record_hash";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub chain_head: String,
    pub files: Vec<ExportFileDigest>,
}

/// Outcome of walking the decision chain from its oldest retained row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    pub ok: bool,
    pub rows_checked: usize,
    pub first_seq: Option<i64>,
    pub head_hash: String,
    pub broken_at: Option<i64>,
    pub detail: Option<String>,
}

impl SqliteStore {
    /// Append one decision, linking it to the current chain head.
    ///
    /// Runs in an immediate transaction so concurrent writers serialize on the head.
    ///
    /// # Errors
    /// Returns an error when the head cannot be read, hashing input cannot be
    /// serialized, or the insert fails. Callers must treat this as fail-closed.
    pub fn append_decision(
        &mut self,
        pending: &PendingDecision,
        retention_days: u32,
    ) -> Result<PermissionDecision> {
        let mut body = pending.clone();
        body.timestamp = body.timestamp.to_offset(UtcOffset::UTC);
        let retain_until = (body.timestamp + Duration::days(i64::from(retention_days)))
            .replace_nanosecond(0)
            .context("failed to truncate retain_until")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start audit append transaction")?;
        let decision = append_row(&tx, body, retain_until)?;
        tx.commit().context("failed to commit audit append")?;

        tracing::debug!(
            seq = decision.seq,
            decision = decision.body.decision.as_str(),
            resource = decision.body.resource.as_str(),
            action = decision.body.action.as_str(),
            "appended permission decision"
        );
        Ok(decision)
    }

    /// Append the decisions in `live` that this log does not hold, oldest first.
    ///
    /// Each keeps its body and `retain_until` and is linked to the current head.
    pub(crate) fn carry_over_decisions(&mut self, live: &[PermissionDecision]) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start decision carry-over transaction")?;
        let known: BTreeSet<String> = {
            let mut stmt = tx.prepare("SELECT decision_id FROM permission_decisions")?;
            let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;
            ids.collect::<rusqlite::Result<_>>()?
        };
        let mut carried = 0_usize;
        for decision in live {
            if known.contains(&decision.body.decision_id.to_string()) {
                continue;
            }
            append_row(&tx, decision.body.clone(), decision.retain_until)?;
            carried += 1;
        }
        tx.commit().context("failed to commit decision carry-over")?;
        Ok(carried)
    }

    /// Query decisions in append order.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn find_decisions(&self, filter: &AuditFilter) -> Result<Vec<PermissionDecision>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(caller_id) = filter.caller_id {
            clauses.push("caller_id = ?");
            values.push(Value::Text(caller_id.to_string()));
        }
        if let Some(resource) = filter.resource {
            clauses.push("resource = ?");
            values.push(Value::Text(resource.as_str().to_string()));
        }
        if let Some(action) = filter.action {
            clauses.push("action = ?");
            values.push(Value::Text(action.as_str().to_string()));
        }
        if let Some(outcome) = filter.outcome {
            clauses.push("decision = ?");
            values.push(Value::Text(outcome.as_str().to_string()));
        }
        if let Some(resource_id) = &filter.resource_id {
            clauses.push("resource_id = ?");
            values.push(Value::Text(resource_id.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("timestamp_ns >= ?");
            values.push(Value::Integer(unix_nanos(since)?));
        }
        if let Some(until) = filter.until {
            clauses.push("timestamp_ns <= ?");
            values.push(Value::Integer(unix_nanos(until)?));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit_clause = match filter.limit {
            Some(limit) => {
                values.push(Value::Integer(i64::from(limit)));
                " LIMIT ?"
            }
            None => "",
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DECISION_COLUMNS} FROM permission_decisions {where_clause}
             ORDER BY seq ASC{limit_clause}"
        ))?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut decisions = Vec::new();
        while let Some(row) = rows.next()? {
            decisions.push(decode_decision(row)?);
        }
        Ok(decisions)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn decision_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM permission_decisions", [], |row| row.get(0))
            .context("failed to count permission decisions")
    }

    /// Recompute every hash and check each link to its predecessor.
    ///
    /// The oldest retained row anchors the walk. It must carry the genesis hash
    /// unless an older prefix was purged under retention.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read. A row that fails to decode is
    /// reported as a break, not an error.
    pub fn verify_chain(&self) -> Result<ChainReport> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DECISION_COLUMNS} FROM permission_decisions ORDER BY seq ASC"
        ))?;
        let mut rows = stmt.query([])?;

        let mut report = ChainReport {
            ok: true,
            rows_checked: 0,
            first_seq: None,
            head_hash: GENESIS_HASH.to_string(),
            broken_at: None,
            detail: None,
        };
        let mut previous: Option<(i64, String)> = None;

        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            let decision = match decode_decision(row) {
                Ok(decision) => decision,
                Err(err) => return Ok(broken(report, seq, format!("undecodable row: {err:#}"))),
            };
            report.rows_checked += 1;

            match &previous {
                None => {
                    report.first_seq = Some(seq);
                    if seq == 1 && decision.prev_hash != GENESIS_HASH {
                        return Ok(broken(report, seq, "first row does not link to genesis"));
                    }
                }
                Some((prev_seq, prev_hash)) => {
                    if seq != prev_seq + 1 {
                        return Ok(broken(report, seq, format!("gap after seq {prev_seq}")));
                    }
                    if &decision.prev_hash != prev_hash {
                        return Ok(broken(report, seq, "prev_hash does not match predecessor"));
                    }
                }
            }

            let expected = chain_hash(seq, &decision.prev_hash, &decision.body)?;
            if expected != decision.record_hash {
                return Ok(broken(report, seq, "record_hash does not match row contents"));
            }
            report.head_hash.clone_from(&decision.record_hash);
            previous = Some((seq, decision.record_hash));
        }

        Ok(report)
    }

    /// Delete the expired prefix of the log. Rows still inside retention stop the sweep.
    ///
    /// # Errors
    /// Returns an error when the delete fails, including when the retention
    /// trigger rejects a row.
    pub fn purge_expired_decisions(&mut self, now: OffsetDateTime) -> Result<usize> {
        let now = rfc3339(now.to_offset(UtcOffset::UTC).replace_nanosecond(0)?)?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM permission_decisions
                 WHERE retain_until <= ?1
                   AND seq < COALESCE(
                     (SELECT MIN(seq) FROM permission_decisions WHERE retain_until > ?1),
                     9223372036854775807
                   )",
                params![now],
            )
            .context("failed to purge expired permission decisions")?;
        if deleted > 0 {
            tracing::info!(deleted, "purged expired permission decisions");
        }
        Ok(deleted)
    }

    /// Write the full log as NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when the export directory or files cannot be written.
    pub fn export_decisions(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let decisions = self.find_decisions(&AuditFilter::default())?;
        let chain_head = decisions
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |decision| decision.record_hash.clone());

        let decisions_path = out_dir.join(DECISIONS_FILE);
        let (sha256, records) = write_ndjson_file(&decisions_path, &decisions)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            chain_head,
            files: vec![ExportFileDigest { path: DECISIONS_FILE.to_string(), sha256, records }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }
}

/// Check an export directory against its manifest digests and record counts.
///
/// # Errors
/// Returns an error when the manifest is unreadable or any file does not match it.
pub fn verify_export(in_dir: &Path) -> Result<ExportManifest> {
    let manifest_path = in_dir.join("manifest.json");
    let bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
    let manifest: ExportManifest = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", manifest_path.display()))?;

    for file in &manifest.files {
        let (sha256, records) = ndjson_digest_and_records(&in_dir.join(&file.path))?;
        if sha256 != file.sha256 {
            return Err(anyhow!("digest mismatch for export file {}", file.path));
        }
        if records != file.records {
            return Err(anyhow!(
                "record count mismatch for export file {}: manifest={}, actual={records}",
                file.path,
                file.records
            ));
        }
    }
    Ok(manifest)
}

fn broken(mut report: ChainReport, seq: i64, detail: impl Into<String>) -> ChainReport {
    let detail = detail.into();
    tracing::warn!(seq, %detail, "permission decision chain is broken");
    report.ok = false;
    report.broken_at = Some(seq);
    report.detail = Some(detail);
    report
}

/// Link `body` to the current head inside an open transaction.
fn append_row(
    conn: &Connection,
    body: PendingDecision,
    retain_until: OffsetDateTime,
) -> Result<PermissionDecision> {
    let head: Option<(i64, String)> = conn
        .query_row(
            "SELECT seq, record_hash FROM permission_decisions ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("failed to read audit chain head")?;
    let (seq, prev_hash) = match head {
        Some((last_seq, last_hash)) => (last_seq + 1, last_hash),
        None => (1, GENESIS_HASH.to_string()),
    };
    let record_hash = chain_hash(seq, &prev_hash, &body)?;

    conn.execute(
        &format!(
            "INSERT INTO permission_decisions({DECISION_COLUMNS}, timestamp_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            seq,
            body.decision_id.to_string(),
            rfc3339(body.timestamp)?,
            body.caller_id.to_string(),
            body.resource.as_str(),
            body.action.as_str(),
            body.resource_id,
            body.sensitivity_tier.map(ContextSensitivity::as_str),
            body.decision.as_str(),
            body.reason.map(DenyReason::as_str),
            body.effective_role.map(Role::as_str),
            serde_json::to_string(&body.scope_chain).context("failed to serialize scope chain")?,
            rfc3339(retain_until)?,
            prev_hash,
            record_hash,
            unix_nanos(body.timestamp)?,
        ],
    )
    .context("failed to append permission decision")?;
    Ok(PermissionDecision { seq, body, retain_until, prev_hash, record_hash })
}

/// Fill `timestamp_ns` for rows written before the column existed.
pub(crate) fn backfill_timestamp_ns(conn: &Connection) -> Result<()> {
    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare("SELECT seq, timestamp FROM permission_decisions")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for (seq, timestamp) in &rows {
        conn.execute(
            "UPDATE permission_decisions SET timestamp_ns = ?1 WHERE seq = ?2",
            params![unix_nanos(parse_rfc3339(timestamp)?)?, seq],
        )
        .with_context(|| format!("failed to backfill timestamp_ns for seq {seq}"))?;
    }
    if !rows.is_empty() {
        tracing::info!(rows = rows.len(), "backfilled permission decision timestamps");
    }
    Ok(())
}

fn chain_hash(seq: i64, prev_hash: &str, body: &PendingDecision) -> Result<String> {
    let body_json = serde_json::to_string(body).context("failed to serialize decision body")?;
    let mut hasher = Sha256::new();
    hasher.update(format!("{seq}|{prev_hash}|{body_json}").as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn decode_decision(row: &Row<'_>) -> Result<PermissionDecision> {
    let resource_raw: String = row.get(4)?;
    let action_raw: String = row.get(5)?;
    let tier_raw: Option<String> = row.get(7)?;
    let decision_raw: String = row.get(8)?;
    let reason_raw: Option<String> = row.get(9)?;
    let role_raw: Option<String> = row.get(10)?;
    let scope_chain_json: String = row.get(11)?;

    let body = PendingDecision {
        decision_id: DecisionId(parse_ulid(&row.get::<_, String>(1)?)?),
        timestamp: parse_rfc3339(&row.get::<_, String>(2)?)?,
        caller_id: UserId(parse_ulid(&row.get::<_, String>(3)?)?),
        resource: Resource::parse(&resource_raw)
            .ok_or_else(|| anyhow!("unknown resource: {resource_raw}"))?,
        action: Action::parse(&action_raw).ok_or_else(|| anyhow!("unknown action: {action_raw}"))?,
        resource_id: row.get(6)?,
        sensitivity_tier: tier_raw
            .map(|raw| {
                ContextSensitivity::parse(&raw)
                    .ok_or_else(|| anyhow!("unknown sensitivity_tier: {raw}"))
            })
            .transpose()?,
        decision: DecisionOutcome::parse(&decision_raw)
            .ok_or_else(|| anyhow!("unknown decision: {decision_raw}"))?,
        reason: reason_raw
            .map(|raw| DenyReason::parse(&raw).ok_or_else(|| anyhow!("unknown reason: {raw}")))
            .transpose()?,
        effective_role: role_raw
            .map(|raw| Role::parse(&raw).ok_or_else(|| anyhow!("unknown role: {raw}")))
            .transpose()?,
        scope_chain: serde_json::from_str(&scope_chain_json)
            .context("failed to deserialize scope chain")?,
    };

    Ok(PermissionDecision {
        seq: row.get(0)?,
        body,
        retain_until: parse_rfc3339(&row.get::<_, String>(12)?)?,
        prev_hash: row.get(13)?,
        record_hash: row.get(14)?,
    })
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}
