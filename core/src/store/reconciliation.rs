use super::{
    CustomerAccountRow, FeeTotalsRow, InventoryAuditRow, LateFeeRow, OpenLoanStatsRow,
    OverdueLoanRow, ReturnedLoanRow, ReturnsSnapshot, SimStore,
};
use crate::{
    error::SimResult,
    types::{CustomerId, LoanId, UnitId},
};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

/// Upper bound on rows written per transaction during a pass.
const WRITE_CHUNK: usize = 500;

const LATE_FEE_COLUMNS: &str =
    "loan_id, customer_id, days_overdue, fee_amount, amount_paid, status, finalized, computed_as_of";

fn map_late_fee_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LateFeeRow> {
    Ok(LateFeeRow {
        loan_id:        row.get(0)?,
        customer_id:    row.get(1)?,
        days_overdue:   row.get(2)?,
        fee_amount:     row.get(3)?,
        amount_paid:    row.get(4)?,
        status:         row.get(5)?,
        finalized:      row.get(6)?,
        computed_as_of: row.get(7)?,
    })
}

fn map_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomerAccountRow> {
    Ok(CustomerAccountRow {
        customer_id:         row.get(0)?,
        outstanding_balance: row.get(1)?,
        total_late_fees:     row.get(2)?,
        paid_late_fees:      row.get(3)?,
        open_loans:          row.get(4)?,
        overdue_loans:       row.get(5)?,
        standing:            row.get(6)?,
        aging_bucket:        row.get(7)?,
        last_payment_on:     row.get(8)?,
        computed_as_of:      row.get(9)?,
    })
}

fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryAuditRow> {
    Ok(InventoryAuditRow {
        audit_id:   row.get(0)?,
        change_id:  row.get(1)?,
        unit_id:    row.get(2)?,
        old_status: row.get(3)?,
        new_status: row.get(4)?,
        changed_on: row.get(5)?,
        actor:      row.get(6)?,
    })
}

impl SimStore {
    // ─────────────────────────────────────────────────────────────────
    // Integrity scan
    // ─────────────────────────────────────────────────────────────────

    /// Units referenced by more than one open loan, with the loan ids,
    /// ordered by unit then loan.
    pub fn double_checkouts(&self) -> SimResult<Vec<(UnitId, Vec<LoanId>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT unit_id, loan_id FROM loan
             WHERE return_date IS NULL
               AND unit_id IN (
                   SELECT unit_id FROM loan
                   WHERE return_date IS NULL
                   GROUP BY unit_id HAVING COUNT(*) > 1
               )
             ORDER BY unit_id, loan_id",
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get::<_, UnitId>(0)?, row.get::<_, LoanId>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups: Vec<(UnitId, Vec<LoanId>)> = Vec::new();
        for (unit_id, loan_id) in pairs {
            match groups.last_mut() {
                Some((last, loans)) if *last == unit_id => loans.push(loan_id),
                _ => groups.push((unit_id, vec![loan_id])),
            }
        }
        Ok(groups)
    }

    /// Open loans whose unit claims to be available.
    pub fn open_loans_on_available_units(&self) -> SimResult<Vec<(UnitId, LoanId)>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.unit_id, l.loan_id
             FROM loan l JOIN inventory_unit u ON u.unit_id = l.unit_id
             WHERE l.return_date IS NULL AND u.status = 'available'
             ORDER BY l.unit_id, l.loan_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─────────────────────────────────────────────────────────────────
    // Fee inputs
    // ─────────────────────────────────────────────────────────────────

    /// Open loans started before `started_before`. Served by the partial
    /// index over open loans, so cost follows the open set, not history.
    pub fn open_loans_started_before(&self, started_before: NaiveDate) -> SimResult<Vec<OverdueLoanRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT loan_id, customer_id, unit_id, start_date
             FROM loan
             WHERE return_date IS NULL AND start_date < ?1
             ORDER BY loan_id",
        )?;
        let rows = stmt
            .query_map(params![started_before], |row| {
                Ok(OverdueLoanRow {
                    loan_id:     row.get(0)?,
                    customer_id: row.get(1)?,
                    unit_id:     row.get(2)?,
                    start_date:  row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns and late-fee payments not yet folded in, read inside one
    /// read transaction. A return and the payment recorded with it are
    /// either both visible or both not, even while another connection is
    /// writing.
    pub fn returns_since_watermark(&self) -> SimResult<ReturnsSnapshot> {
        let tx = self.conn.unchecked_transaction()?;
        let (returns_through_seq, payments_through_id): (i64, i64) = tx.query_row(
            "SELECT returns_through_seq, payments_through_id FROM reconciliation_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let returns = {
            let mut stmt = tx.prepare(
                "SELECT loan_id, customer_id, start_date, return_date, return_seq
                 FROM loan
                 WHERE return_seq > ?1
                 ORDER BY return_seq",
            )?;
            let rows = stmt
                .query_map(params![returns_through_seq], |row| {
                    Ok(ReturnedLoanRow {
                        loan_id:     row.get(0)?,
                        customer_id: row.get(1)?,
                        start_date:  row.get(2)?,
                        return_date: row.get(3)?,
                        return_seq:  row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let newly_paid = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT loan_id FROM payment
                 WHERE kind = 'late_fee' AND payment_id > ?1
                 ORDER BY loan_id",
            )?;
            let ids = stmt
                .query_map(params![payments_through_id], |row| row.get(0))?
                .collect::<Result<Vec<LoanId>, _>>()?;
            ids
        };

        let late_fee_paid = {
            let mut stmt = tx.prepare(
                "SELECT p.loan_id, SUM(p.amount)
                 FROM payment p
                 WHERE p.kind = 'late_fee'
                   AND (p.loan_id IN (SELECT loan_id FROM loan WHERE return_seq > ?1)
                        OR p.loan_id IN (SELECT loan_id FROM payment
                                         WHERE kind = 'late_fee' AND payment_id > ?2))
                 GROUP BY p.loan_id",
            )?;
            let totals = stmt
                .query_map(params![returns_through_seq, payments_through_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<HashMap<_, _>, _>>()?;
            totals
        };

        let last_payment_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(payment_id), ?1) FROM payment",
            params![payments_through_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(ReturnsSnapshot {
            returns_through_seq,
            returns,
            late_fee_paid,
            newly_paid,
            payments_through_id,
            last_payment_id,
        })
    }

    /// Both watermarks only ever move forward.
    pub fn advance_watermarks(&self, returns_through_seq: Option<i64>, payments_through_id: i64) -> SimResult<()> {
        self.conn.execute(
            "UPDATE reconciliation_state
             SET returns_through_seq = MAX(returns_through_seq, COALESCE(?1, 0)),
                 payments_through_id = MAX(payments_through_id, ?2)
             WHERE id = 1",
            params![returns_through_seq, payments_through_id],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Late fee records
    // ─────────────────────────────────────────────────────────────────

    /// Every fee record still able to change.
    pub fn unfinalized_late_fees(&self) -> SimResult<HashMap<LoanId, LateFeeRow>> {
        let sql = format!("SELECT {LATE_FEE_COLUMNS} FROM late_fee WHERE finalized = 0");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_late_fee_row)?
            .map(|r| r.map(|fee| (fee.loan_id, fee)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    /// Write fee records keyed by loan id, a bounded chunk per transaction.
    /// Rows already finalized are never touched.
    pub fn upsert_late_fees(&self, rows: &[LateFeeRow]) -> SimResult<()> {
        for chunk in rows.chunks(WRITE_CHUNK) {
            let tx = self.write_tx()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO late_fee
                        (loan_id, customer_id, days_overdue, fee_amount, amount_paid,
                         status, finalized, computed_as_of)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(loan_id) DO UPDATE SET
                        days_overdue   = excluded.days_overdue,
                        fee_amount     = excluded.fee_amount,
                        amount_paid    = excluded.amount_paid,
                        status         = excluded.status,
                        finalized      = excluded.finalized,
                        computed_as_of = excluded.computed_as_of
                     WHERE late_fee.finalized = 0",
                )?;
                for fee in chunk {
                    stmt.execute(params![
                        fee.loan_id,
                        fee.customer_id,
                        fee.days_overdue,
                        fee.fee_amount,
                        fee.amount_paid,
                        fee.status,
                        fee.finalized,
                        fee.computed_as_of,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// Fold payments made after finalization into finalized fee records.
    /// Only `amount_paid` and `status` move, and only on finalized rows.
    pub fn update_finalized_payments(&self, rows: &[LateFeeRow]) -> SimResult<()> {
        for chunk in rows.chunks(WRITE_CHUNK) {
            let tx = self.write_tx()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE late_fee
                     SET amount_paid = ?2, status = ?3, computed_as_of = ?4
                     WHERE loan_id = ?1 AND finalized = 1",
                )?;
                for fee in chunk {
                    stmt.execute(params![fee.loan_id, fee.amount_paid, fee.status, fee.computed_as_of])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    pub fn get_late_fee(&self, loan_id: LoanId) -> SimResult<Option<LateFeeRow>> {
        let sql = format!("SELECT {LATE_FEE_COLUMNS} FROM late_fee WHERE loan_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![loan_id], map_late_fee_row)
            .optional()?;
        Ok(row)
    }

    pub fn all_late_fees(&self) -> SimResult<Vec<LateFeeRow>> {
        let sql = format!("SELECT {LATE_FEE_COLUMNS} FROM late_fee ORDER BY loan_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_late_fee_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─────────────────────────────────────────────────────────────────
    // Customer accounts
    // ─────────────────────────────────────────────────────────────────

    pub fn fee_totals_by_customer(&self) -> SimResult<Vec<FeeTotalsRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id,
                    COALESCE(SUM(CASE WHEN status <> 'written_off'
                                      THEN fee_amount - amount_paid ELSE 0 END), 0),
                    COALESCE(SUM(fee_amount), 0),
                    COALESCE(SUM(amount_paid), 0)
             FROM late_fee
             GROUP BY customer_id
             ORDER BY customer_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FeeTotalsRow {
                    customer_id: row.get(0)?,
                    outstanding: row.get(1)?,
                    total:       row.get(2)?,
                    paid:        row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Open and overdue loan counts per customer. A loan counts as overdue
    /// when it started before `overdue_if_started_before`.
    pub fn open_loan_stats_by_customer(
        &self,
        overdue_if_started_before: NaiveDate,
    ) -> SimResult<Vec<OpenLoanStatsRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id,
                    COUNT(*),
                    SUM(CASE WHEN start_date < ?1 THEN 1 ELSE 0 END),
                    MIN(start_date)
             FROM loan
             WHERE return_date IS NULL
             GROUP BY customer_id
             ORDER BY customer_id",
        )?;
        let rows = stmt
            .query_map(params![overdue_if_started_before], |row| {
                Ok(OpenLoanStatsRow {
                    customer_id:       row.get(0)?,
                    open_loans:        row.get(1)?,
                    overdue_loans:     row.get(2)?,
                    oldest_open_start: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn last_payment_by_customer(&self) -> SimResult<HashMap<CustomerId, NaiveDate>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, MAX(paid_on) FROM payment GROUP BY customer_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }

    /// Replace the materialized account rows.
    pub fn upsert_customer_accounts(&self, rows: &[CustomerAccountRow]) -> SimResult<()> {
        for chunk in rows.chunks(WRITE_CHUNK) {
            let tx = self.write_tx()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO customer_account
                        (customer_id, outstanding_balance, total_late_fees, paid_late_fees,
                         open_loans, overdue_loans, standing, aging_bucket, last_payment_on,
                         computed_as_of)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(customer_id) DO UPDATE SET
                        outstanding_balance = excluded.outstanding_balance,
                        total_late_fees     = excluded.total_late_fees,
                        paid_late_fees      = excluded.paid_late_fees,
                        open_loans          = excluded.open_loans,
                        overdue_loans       = excluded.overdue_loans,
                        standing            = excluded.standing,
                        aging_bucket        = excluded.aging_bucket,
                        last_payment_on     = excluded.last_payment_on,
                        computed_as_of      = excluded.computed_as_of",
                )?;
                for acct in chunk {
                    stmt.execute(params![
                        acct.customer_id,
                        acct.outstanding_balance,
                        acct.total_late_fees,
                        acct.paid_late_fees,
                        acct.open_loans,
                        acct.overdue_loans,
                        acct.standing,
                        acct.aging_bucket,
                        acct.last_payment_on,
                        acct.computed_as_of,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    pub fn get_customer_account(&self, customer_id: CustomerId) -> SimResult<Option<CustomerAccountRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT customer_id, outstanding_balance, total_late_fees, paid_late_fees,
                        open_loans, overdue_loans, standing, aging_bucket, last_payment_on,
                        computed_as_of
                 FROM customer_account WHERE customer_id = ?1",
                params![customer_id],
                map_account_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn all_customer_accounts(&self) -> SimResult<Vec<CustomerAccountRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, outstanding_balance, total_late_fees, paid_late_fees,
                    open_loans, overdue_loans, standing, aging_bucket, last_payment_on,
                    computed_as_of
             FROM customer_account ORDER BY customer_id",
        )?;
        let rows = stmt
            .query_map([], map_account_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─────────────────────────────────────────────────────────────────
    // Inventory audit
    // ─────────────────────────────────────────────────────────────────

    /// Copy journaled status changes not yet audited into the audit log
    /// and bring each touched unit's `audited_status` up to date.
    /// Returns the number of audit rows appended.
    pub fn drain_status_changes(&self) -> SimResult<u64> {
        let tx = self.write_tx()?;
        let audited_through: i64 = tx.query_row(
            "SELECT COALESCE(MAX(change_id), 0) FROM inventory_audit_event",
            [],
            |row| row.get(0),
        )?;
        let appended = tx.execute(
            "INSERT OR IGNORE INTO inventory_audit_event
                (change_id, unit_id, old_status, new_status, changed_on, actor)
             SELECT change_id, unit_id, old_status, new_status, changed_on, actor
             FROM inventory_status_change
             WHERE change_id > ?1
             ORDER BY change_id",
            params![audited_through],
        )?;
        if appended > 0 {
            tx.execute(
                "UPDATE inventory_unit
                 SET audited_status = (
                     SELECT a.new_status FROM inventory_audit_event a
                     WHERE a.unit_id = inventory_unit.unit_id
                     ORDER BY a.change_id DESC LIMIT 1
                 )
                 WHERE unit_id IN (
                     SELECT unit_id FROM inventory_audit_event WHERE change_id > ?1
                 )",
                params![audited_through],
            )?;
        }
        tx.commit()?;
        Ok(appended as u64)
    }

    pub fn audit_events_for_unit(&self, unit_id: UnitId) -> SimResult<Vec<InventoryAuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT audit_id, change_id, unit_id, old_status, new_status, changed_on, actor
             FROM inventory_audit_event WHERE unit_id = ?1 ORDER BY change_id",
        )?;
        let rows = stmt
            .query_map(params![unit_id], map_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_audit_events(&self) -> SimResult<Vec<InventoryAuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT audit_id, change_id, unit_id, old_status, new_status, changed_on, actor
             FROM inventory_audit_event ORDER BY change_id",
        )?;
        let rows = stmt
            .query_map([], map_audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
