use std::path::Path;

use access_kernel_core::{
    AccessTarget, Action, AuditFilter, CallerContext, Decision, PermissionDecision, Resource,
};
use access_kernel_store_sqlite::{ChainReport, ExportManifest};

use crate::{AccessKernel, AccessResult};

impl AccessKernel {
    /// Query the decision log. Needs AUDIT on AUDIT at global scope.
    ///
    /// The result includes the decision made for this query.
    ///
    /// # Errors
    /// [`crate::AccessError::AuditUnavailable`] when the decision cannot be recorded.
    pub fn query_audit(
        &self,
        caller: &CallerContext,
        filter: &AuditFilter,
    ) -> AccessResult<Vec<PermissionDecision>> {
        let mut req = self.begin(caller)?;
        if let Decision::Denied(reason) =
            req.authorize(Resource::Audit, Action::Audit, AccessTarget::Global, None)?
        {
            return Ok(Decision::Denied(reason));
        }
        Ok(Decision::Allowed(req.store.find_decisions(filter)?))
    }

    /// Write a compliance export of the decision log. Needs EXPORT on AUDIT.
    ///
    /// # Errors
    /// Returns an error when the export files cannot be written.
    pub fn export_audit(
        &self,
        caller: &CallerContext,
        out_dir: &Path,
    ) -> AccessResult<ExportManifest> {
        let mut req = self.begin(caller)?;
        if let Decision::Denied(reason) =
            req.authorize(Resource::Audit, Action::Export, AccessTarget::Global, None)?
        {
            return Ok(Decision::Denied(reason));
        }
        let manifest = req.store.export_decisions(out_dir)?;
        tracing::info!(
            caller = %caller.user_id,
            out_dir = %out_dir.display(),
            records = manifest.files.iter().map(|file| file.records).sum::<usize>(),
            "exported permission decisions"
        );
        Ok(Decision::Allowed(manifest))
    }

    /// Walk the hash chain. Needs AUDIT on AUDIT.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read.
    pub fn verify_audit_chain(&self, caller: &CallerContext) -> AccessResult<ChainReport> {
        let mut req = self.begin(caller)?;
        if let Decision::Denied(reason) =
            req.authorize(Resource::Audit, Action::Audit, AccessTarget::Global, None)?
        {
            return Ok(Decision::Denied(reason));
        }
        let report = req.store.verify_chain()?;
        if !report.ok {
            tracing::error!(
                broken_at = report.broken_at,
                detail = report.detail.as_deref(),
                "permission decision chain failed verification"
            );
        }
        Ok(Decision::Allowed(report))
    }

    /// Back up the database. Needs BACKUP on BACKUP at global scope.
    ///
    /// # Errors
    /// Returns an error when the backup file cannot be written.
    pub fn backup_database(&self, caller: &CallerContext, out_file: &Path) -> AccessResult<()> {
        let mut req = self.begin(caller)?;
        if let Decision::Denied(reason) =
            req.authorize(Resource::Backup, Action::Backup, AccessTarget::Global, None)?
        {
            return Ok(Decision::Denied(reason));
        }
        req.store.backup_database(out_file)?;
        tracing::info!(
            caller = %caller.user_id,
            out_file = %out_file.display(),
            "backed up database"
        );
        Ok(Decision::Allowed(()))
    }

    /// Replace the database with a backup. Needs RESTORE on BACKUP.
    ///
    /// The store carries every decision the backup lacks over to the restored
    /// log, this restore decision included.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be restored or the live decisions
    /// cannot be carried over.
    pub fn restore_database(&self, caller: &CallerContext, in_file: &Path) -> AccessResult<()> {
        let mut req = self.begin(caller)?;
        let decision =
            req.authorize(Resource::Backup, Action::Restore, AccessTarget::Global, None)?;
        let gate = match decision {
            Decision::Allowed(gate) => gate,
            Decision::Denied(reason) => return Ok(Decision::Denied(reason)),
        };
        let carried = req.store.restore_database(in_file)?;
        tracing::info!(
            caller = %caller.user_id,
            decision_id = %gate.record.body.decision_id,
            in_file = %in_file.display(),
            carried,
            "restored database"
        );
        Ok(Decision::Allowed(()))
    }
}
