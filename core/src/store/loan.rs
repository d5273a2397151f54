use super::{
    inventory::journal_status_change, shard_filter, ClaimOutcome, LoanRow, NewLoan, PaymentRow,
    RecentRentalRow, ReturnOutcome, SimStore,
};
use crate::{
    config::ShardConfig,
    error::SimResult,
    types::{CustomerId, LoanId, PaymentKind, UnitId, UnitStatus},
};
use chrono::NaiveDate;
use rusqlite::{named_params, params, OptionalExtension};

pub const ALLOCATOR_ACTOR: &str = "allocator";
pub const RETURN_ACTOR: &str = "return";

const LOAN_COLUMNS: &str =
    "loan_id, customer_id, unit_id, catalog_item_id, start_date, due_back_on, return_date, return_seq";

fn map_loan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoanRow> {
    Ok(LoanRow {
        loan_id:         row.get(0)?,
        customer_id:     row.get(1)?,
        unit_id:         row.get(2)?,
        catalog_item_id: row.get(3)?,
        start_date:      row.get(4)?,
        due_back_on:     row.get(5)?,
        return_date:     row.get(6)?,
        return_seq:      row.get(7)?,
    })
}

impl SimStore {
    // ── Checkout ─────────────────────────────────────────────────

    /// Claim the unit, create the loan and take the rental payment in one
    /// transaction.
    ///
    /// The claim is a conditional update on `status = 'available'`; when it
    /// touches no row another writer got there first and nothing is written.
    pub fn commit_loan(&self, loan: &NewLoan) -> SimResult<ClaimOutcome> {
        let tx = self.write_tx()?;
        let claimed = tx.execute(
            "UPDATE inventory_unit SET status = 'on_loan'
             WHERE unit_id = ?1 AND status = 'available'",
            params![loan.unit_id],
        )?;
        if claimed == 0 {
            return Ok(ClaimOutcome::Lost);
        }
        tx.execute(
            "INSERT INTO loan (customer_id, unit_id, catalog_item_id, start_date, due_back_on)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                loan.customer_id,
                loan.unit_id,
                loan.catalog_item_id,
                loan.start_date,
                loan.due_back_on,
            ],
        )?;
        let loan_id = tx.last_insert_rowid();
        if let Some(price) = loan.rental_price {
            tx.execute(
                "INSERT INTO payment (loan_id, customer_id, kind, amount, paid_on)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![loan_id, loan.customer_id, PaymentKind::Rental, price, loan.start_date],
            )?;
        }
        tx.execute(
            "UPDATE catalog_item SET rental_count = rental_count + 1 WHERE catalog_item_id = ?1",
            params![loan.catalog_item_id],
        )?;
        journal_status_change(
            &tx,
            loan.unit_id,
            UnitStatus::Available,
            UnitStatus::OnLoan,
            loan.start_date,
            ALLOCATOR_ACTOR,
        )?;
        tx.commit()?;
        Ok(ClaimOutcome::Committed(loan_id))
    }

    /// Load a historical loan from an external source as-is.
    ///
    /// Unit status and rental counters are left untouched, so imported
    /// history is exactly what the reconciliation scan sees.
    pub fn import_loan(&self, loan: &NewLoan, return_date: Option<NaiveDate>) -> SimResult<LoanId> {
        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO loan (customer_id, unit_id, catalog_item_id, start_date, due_back_on,
                               return_date, return_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                     CASE WHEN ?6 IS NULL THEN NULL
                          ELSE (SELECT COALESCE(MAX(return_seq), 0) + 1 FROM loan) END)",
            params![
                loan.customer_id,
                loan.unit_id,
                loan.catalog_item_id,
                loan.start_date,
                loan.due_back_on,
                return_date,
            ],
        )?;
        let loan_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(loan_id)
    }

    // ── Returns ──────────────────────────────────────────────────

    /// Open loans planned back on or before `through`, for this shard's
    /// customers, oldest due date first.
    pub fn returns_due_through(&self, through: NaiveDate, shard: ShardConfig) -> SimResult<Vec<LoanRow>> {
        let sql = format!(
            "SELECT {LOAN_COLUMNS} FROM loan
             WHERE return_date IS NULL AND due_back_on <= :through AND {}
             ORDER BY due_back_on, loan_id",
            shard_filter("customer_id"),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":through": through,
                    ":shard_count": shard.count,
                    ":shard_index": shard.index,
                },
                map_loan_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Close the loan, release its unit and record any late-fee payment
    /// made at the counter, all in one transaction.
    ///
    /// The loan update is conditional on the loan still being open, so
    /// recording the same return twice is harmless and never pays twice.
    /// The unit only goes back to available if it is still on loan.
    pub fn record_return(
        &self,
        loan_id: LoanId,
        unit_id: UnitId,
        on: NaiveDate,
        late_fee_payment: Option<f64>,
    ) -> SimResult<ReturnOutcome> {
        let tx = self.write_tx()?;
        let closed = tx.execute(
            "UPDATE loan
             SET return_date = ?1,
                 return_seq  = (SELECT COALESCE(MAX(return_seq), 0) + 1 FROM loan)
             WHERE loan_id = ?2 AND return_date IS NULL",
            params![on, loan_id],
        )?;
        if closed == 0 {
            return Ok(ReturnOutcome::AlreadyReturned);
        }
        let released = tx.execute(
            "UPDATE inventory_unit SET status = 'available'
             WHERE unit_id = ?1 AND status = 'on_loan'",
            params![unit_id],
        )?;
        if released > 0 {
            journal_status_change(&tx, unit_id, UnitStatus::OnLoan, UnitStatus::Available, on, RETURN_ACTOR)?;
        }
        if let Some(amount) = late_fee_payment {
            tx.execute(
                "INSERT INTO payment (loan_id, customer_id, kind, amount, paid_on)
                 SELECT loan_id, customer_id, ?2, ?3, ?4 FROM loan WHERE loan_id = ?1",
                params![loan_id, PaymentKind::LateFee, amount, on],
            )?;
        }
        tx.commit()?;
        Ok(ReturnOutcome::Returned { unit_released: released > 0 })
    }

    // ── Recency window ───────────────────────────────────────────

    /// Every rental started in `[from, to]`, as one batch. The allocator
    /// builds its per-customer exclusion sets from this once per step.
    pub fn rentals_between(&self, from: NaiveDate, to: NaiveDate) -> SimResult<Vec<RecentRentalRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT customer_id, catalog_item_id, start_date
             FROM loan
             WHERE start_date >= ?1 AND start_date <= ?2
             ORDER BY start_date, loan_id",
        )?;
        let rows = stmt
            .query_map(params![from, to], |row| {
                Ok(RecentRentalRow {
                    customer_id:     row.get(0)?,
                    catalog_item_id: row.get(1)?,
                    start_date:      row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Payments ─────────────────────────────────────────────────

    /// A payment taken outside a checkout or return, such as a customer
    /// settling a late fee days later.
    pub fn insert_payment(
        &self,
        loan_id: LoanId,
        customer_id: CustomerId,
        kind: PaymentKind,
        amount: f64,
        paid_on: NaiveDate,
    ) -> SimResult<i64> {
        self.conn.execute(
            "INSERT INTO payment (loan_id, customer_id, kind, amount, paid_on)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![loan_id, customer_id, kind, amount, paid_on],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn payments_for_loan(&self, loan_id: LoanId) -> SimResult<Vec<PaymentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_id, loan_id, customer_id, kind, amount, paid_on
             FROM payment WHERE loan_id = ?1 ORDER BY payment_id",
        )?;
        let rows = stmt
            .query_map(params![loan_id], |row| {
                Ok(PaymentRow {
                    payment_id:  row.get(0)?,
                    loan_id:     row.get(1)?,
                    customer_id: row.get(2)?,
                    kind:        row.get(3)?,
                    amount:      row.get(4)?,
                    paid_on:     row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Loan reads ───────────────────────────────────────────────

    pub fn get_loan(&self, loan_id: LoanId) -> SimResult<Option<LoanRow>> {
        let sql = format!("SELECT {LOAN_COLUMNS} FROM loan WHERE loan_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![loan_id], map_loan_row)
            .optional()?;
        Ok(row)
    }

    pub fn all_loans(&self) -> SimResult<Vec<LoanRow>> {
        let sql = format!("SELECT {LOAN_COLUMNS} FROM loan ORDER BY loan_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_loan_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn loan_count(&self) -> SimResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM loan", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn open_loan_count(&self) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM loan WHERE return_date IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Largest number of open loans referencing any single unit.
    pub fn max_open_loans_per_unit(&self) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COALESCE(MAX(n), 0) FROM (
                 SELECT COUNT(*) AS n FROM loan WHERE return_date IS NULL GROUP BY unit_id
             )",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
