use super::{AvailableUnitRow, CatalogPopularityRow, InventoryUnitRow, SimStore};
use crate::{
    error::SimResult,
    types::{CatalogItemId, UnitId, UnitStatus},
};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Transaction};

impl SimStore {
    // ── Catalog source ───────────────────────────────────────────

    pub fn insert_catalog_item(&self, title: &str, introduced_on: NaiveDate) -> SimResult<CatalogItemId> {
        self.conn.execute(
            "INSERT INTO catalog_item (title, introduced_on) VALUES (?1, ?2)",
            params![title, introduced_on],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_inventory_unit(
        &self,
        catalog_item_id: CatalogItemId,
        introduced_on: NaiveDate,
    ) -> SimResult<UnitId> {
        self.conn.execute(
            "INSERT INTO inventory_unit (catalog_item_id, introduced_on, status)
             VALUES (?1, ?2, 'available')",
            params![catalog_item_id, introduced_on],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn catalog_item_count(&self) -> SimResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM catalog_item", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Rental counts and introduction dates for every item released by `as_of`.
    /// Reads the maintained counter, never the loan table.
    pub fn catalog_popularity(&self, as_of: NaiveDate) -> SimResult<Vec<CatalogPopularityRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT catalog_item_id, rental_count, introduced_on
             FROM catalog_item
             WHERE introduced_on <= ?1
             ORDER BY catalog_item_id",
        )?;
        let rows = stmt
            .query_map(params![as_of], |row| {
                Ok(CatalogPopularityRow {
                    catalog_item_id: row.get(0)?,
                    rental_count:    row.get::<_, i64>(1)?.max(0) as u64,
                    introduced_on:   row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Units ────────────────────────────────────────────────────

    /// Units currently available and in circulation by `as_of`.
    pub fn available_units(&self, as_of: NaiveDate) -> SimResult<Vec<AvailableUnitRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT unit_id, catalog_item_id
             FROM inventory_unit
             WHERE status = 'available' AND introduced_on <= ?1
             ORDER BY catalog_item_id, unit_id",
        )?;
        let rows = stmt
            .query_map(params![as_of], |row| {
                Ok(AvailableUnitRow {
                    unit_id:         row.get(0)?,
                    catalog_item_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_unit(&self, unit_id: UnitId) -> SimResult<Option<InventoryUnitRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT unit_id, catalog_item_id, introduced_on, status, audited_status
                 FROM inventory_unit WHERE unit_id = ?1",
                params![unit_id],
                |row| {
                    Ok(InventoryUnitRow {
                        unit_id:         row.get(0)?,
                        catalog_item_id: row.get(1)?,
                        introduced_on:   row.get(2)?,
                        status:          row.get(3)?,
                        audited_status:  row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn unit_count_by_status(&self, status: UnitStatus) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM inventory_unit WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ── Out-of-band marking ──────────────────────────────────────

    /// Mark a unit damaged or missing. Terminal until `reset_unit`.
    /// Returns false when the unit is already in that status.
    pub fn mark_unit_status(
        &self,
        unit_id: UnitId,
        status: UnitStatus,
        on: NaiveDate,
        actor: &str,
    ) -> SimResult<bool> {
        if !matches!(status, UnitStatus::Damaged | UnitStatus::Missing) {
            return Err(anyhow::anyhow!(
                "out-of-band marking only sets damaged or missing, not {status}"
            )
            .into());
        }
        let tx = self.write_tx()?;
        let old: Option<UnitStatus> = tx
            .query_row(
                "SELECT status FROM inventory_unit WHERE unit_id = ?1",
                params![unit_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(old) = old else {
            return Err(anyhow::anyhow!("unknown inventory unit {unit_id}").into());
        };
        if old == status {
            return Ok(false);
        }
        tx.execute(
            "UPDATE inventory_unit SET status = ?1 WHERE unit_id = ?2",
            params![status, unit_id],
        )?;
        journal_status_change(&tx, unit_id, old, status, on, actor)?;
        tx.commit()?;
        Ok(true)
    }

    /// Put a damaged or missing unit back into circulation.
    /// Refuses while an open loan still references the unit.
    pub fn reset_unit(&self, unit_id: UnitId, on: NaiveDate, actor: &str) -> SimResult<bool> {
        let tx = self.write_tx()?;
        let old: Option<UnitStatus> = tx
            .query_row(
                "SELECT status FROM inventory_unit
                 WHERE unit_id = ?1
                   AND status IN ('damaged', 'missing')
                   AND NOT EXISTS (
                       SELECT 1 FROM loan WHERE unit_id = ?1 AND return_date IS NULL
                   )",
                params![unit_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(old) = old else {
            return Ok(false);
        };
        tx.execute(
            "UPDATE inventory_unit SET status = 'available' WHERE unit_id = ?1",
            params![unit_id],
        )?;
        journal_status_change(&tx, unit_id, old, UnitStatus::Available, on, actor)?;
        tx.commit()?;
        Ok(true)
    }
}

/// Record a status transition. Must run inside the transaction that
/// performed the transition.
pub(super) fn journal_status_change(
    tx: &Transaction<'_>,
    unit_id: UnitId,
    old: UnitStatus,
    new: UnitStatus,
    on: NaiveDate,
    actor: &str,
) -> SimResult<()> {
    tx.execute(
        "INSERT INTO inventory_status_change (unit_id, old_status, new_status, changed_on, actor)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![unit_id, old, new, on, actor],
    )?;
    Ok(())
}
