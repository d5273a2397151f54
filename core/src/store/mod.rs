//! SQLite persistence layer.
//!
//! RULE: Only the store module talks to the database.
//! Subsystems call store methods; they never execute SQL directly.
//!
//! Every method is a short, self-contained transaction. Nothing here holds
//! a transaction open across a whole step, so an aborted step or pass
//! leaves only fully committed rows behind.

use crate::{
    error::{SimError, SimResult},
    event::EventLogEntry,
    types::{
        AccountStanding, ActivityStatus, AgingBucket, CatalogItemId, CustomerId, FeeStatus,
        LoanId, PaymentKind, Step, UnitId, UnitStatus,
    },
};
use chrono::NaiveDate;
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
    Connection, OptionalExtension, Transaction, TransactionBehavior,
};
use std::collections::HashMap;
use std::time::Duration;

mod inventory;
mod lifecycle;
mod loan;
mod reconciliation;

/// How long a writer waits on another worker's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SimStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file or URI
}

impl SimStore {
    pub fn open(path: &str) -> SimResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SimResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open a second connection to the same database, as a separate
    /// worker process would. A plain `:memory:` store has no second
    /// connection; use a file or a shared-cache URI for that.
    pub fn reopen(&self) -> SimResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Err(anyhow::anyhow!("cannot reopen a private in-memory store").into()),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SimResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_inventory.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_loans.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_reconciliation.sql"))?;
        Ok(())
    }

    /// Begin a write transaction that takes the database write lock up
    /// front, so a read-then-write inside it cannot interleave with
    /// another connection's write.
    fn write_tx(&self) -> SimResult<Transaction<'_>> {
        Ok(Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?)
    }

    // ── Run ────────────────────────────────────────────────────

    /// Register a run. Workers sharing a database share the run row,
    /// so a second insert of the same run is a no-op.
    pub fn insert_run(
        &self,
        run_id: &str,
        seed: u64,
        version: &str,
        start_date: NaiveDate,
    ) -> SimResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO run (run_id, seed, version, start_date)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, seed as i64, version, start_date],
        )?;
        Ok(())
    }

    pub fn run_seed(&self, run_id: &str) -> SimResult<Option<u64>> {
        let seed: Option<i64> = self
            .conn
            .query_row("SELECT seed FROM run WHERE run_id = ?1", params![run_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(seed.map(|s| s as u64))
    }

    pub fn record_step_completed(
        &self,
        run_id: &str,
        shard_index: u32,
        step: Step,
        through: NaiveDate,
    ) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO run_progress (run_id, shard_index, last_completed_step, completed_through)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id, shard_index) DO UPDATE SET
                last_completed_step = excluded.last_completed_step,
                completed_through   = excluded.completed_through",
            params![run_id, shard_index, step as i64, through],
        )?;
        Ok(())
    }

    pub fn last_completed_step(&self, run_id: &str, shard_index: u32) -> SimResult<Option<Step>> {
        let step: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_completed_step FROM run_progress
                 WHERE run_id = ?1 AND shard_index = ?2",
                params![run_id, shard_index],
                |row| row.get(0),
            )
            .optional()?;
        Ok(step.map(|s| s as Step))
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, step, subsystem, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id,
                entry.step as i64,
                entry.subsystem,
                entry.event_type,
                entry.payload,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_step(&self, run_id: &str, step: Step) -> SimResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, step, subsystem, event_type, payload
             FROM event_log WHERE run_id = ?1 AND step = ?2
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id, step as i64], map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn events_of_type(&self, run_id: &str, event_type: &str) -> SimResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, step, subsystem, event_type, payload
             FROM event_log WHERE run_id = ?1 AND event_type = ?2
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id, event_type], map_event_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventLogEntry> {
    Ok(EventLogEntry {
        id:         row.get(0)?,
        run_id:     row.get(1)?,
        step:       row.get::<_, i64>(2)? as Step,
        subsystem:  row.get(3)?,
        event_type: row.get(4)?,
        payload:    row.get(5)?,
    })
}

/// SQL `WHERE` fragment restricting a customer id column to one shard.
/// Parameters `?shard_count` and `?shard_index` must be bound by the caller.
fn shard_filter(column: &str) -> String {
    format!("({column} % :shard_count) = :shard_index")
}

// ── Text-backed enums ────────────────────────────────────────────────────────

macro_rules! sql_text_enum {
    ($($ty:ty),+ $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: SimError| FromSqlError::Other(Box::new(e)))
            }
        }
    )+};
}

sql_text_enum!(UnitStatus, ActivityStatus, FeeStatus, AccountStanding, AgingBucket, PaymentKind);

// ── Inventory row types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogPopularityRow {
    pub catalog_item_id: CatalogItemId,
    pub rental_count:    u64,
    pub introduced_on:   NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryUnitRow {
    pub unit_id:         UnitId,
    pub catalog_item_id: CatalogItemId,
    pub introduced_on:   NaiveDate,
    pub status:          UnitStatus,
    pub audited_status:  Option<UnitStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableUnitRow {
    pub unit_id:         UnitId,
    pub catalog_item_id: CatalogItemId,
}

// ── Loan row types ───────────────────────────────────────────────────────────

/// A loan about to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLoan {
    pub customer_id:     CustomerId,
    pub unit_id:         UnitId,
    pub catalog_item_id: CatalogItemId,
    pub start_date:      NaiveDate,
    pub due_back_on:     Option<NaiveDate>,
    /// Rental charge taken at checkout, written with the loan.
    pub rental_price:    Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoanRow {
    pub loan_id:         LoanId,
    pub customer_id:     CustomerId,
    pub unit_id:         UnitId,
    pub catalog_item_id: CatalogItemId,
    pub start_date:      NaiveDate,
    pub due_back_on:     Option<NaiveDate>,
    pub return_date:     Option<NaiveDate>,
    pub return_seq:      Option<i64>,
}

/// Result of trying to claim a unit for a new loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Committed(LoanId),
    /// The unit was no longer available when the conditional update ran.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// The loan is now closed. `unit_released` is false when the unit had
    /// been marked damaged or missing while out.
    Returned { unit_released: bool },
    AlreadyReturned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentRentalRow {
    pub customer_id:     CustomerId,
    pub catalog_item_id: CatalogItemId,
    pub start_date:      NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRow {
    pub payment_id:  i64,
    pub loan_id:     LoanId,
    pub customer_id: CustomerId,
    pub kind:        PaymentKind,
    pub amount:      f64,
    pub paid_on:     NaiveDate,
}

// ── Lifecycle row types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerLifecycleRow {
    pub customer_id:         CustomerId,
    pub joined_on:           NaiveDate,
    pub status:              ActivityStatus,
    pub last_transaction_on: Option<NaiveDate>,
    pub inactivity_streak:   u32,
    pub loyal:               bool,
    /// Step the customer was onboarded in; None for the opening base.
    pub joined_step:         Option<Step>,
    /// Last step whose churn and reactivation draws were applied.
    pub begun_step:          Option<Step>,
    /// Last step whose rentals and inactivity were folded in.
    pub settled_step:        Option<Step>,
}

// ── Reconciliation row types ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LateFeeRow {
    pub loan_id:        LoanId,
    pub customer_id:    CustomerId,
    pub days_overdue:   i64,
    pub fee_amount:     f64,
    pub amount_paid:    f64,
    pub status:         FeeStatus,
    pub finalized:      bool,
    pub computed_as_of: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerAccountRow {
    pub customer_id:         CustomerId,
    pub outstanding_balance: f64,
    pub total_late_fees:     f64,
    pub paid_late_fees:      f64,
    pub open_loans:          i64,
    pub overdue_loans:       i64,
    pub standing:            AccountStanding,
    pub aging_bucket:        AgingBucket,
    pub last_payment_on:     Option<NaiveDate>,
    pub computed_as_of:      NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryAuditRow {
    pub audit_id:   i64,
    pub change_id:  i64,
    pub unit_id:    UnitId,
    pub old_status: UnitStatus,
    pub new_status: UnitStatus,
    pub changed_on: NaiveDate,
    pub actor:      String,
}

/// An open loan old enough to be past the grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverdueLoanRow {
    pub loan_id:     LoanId,
    pub customer_id: CustomerId,
    pub unit_id:     UnitId,
    pub start_date:  NaiveDate,
}

/// A loan whose return was recorded after a given return sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnedLoanRow {
    pub loan_id:     LoanId,
    pub customer_id: CustomerId,
    pub start_date:  NaiveDate,
    pub return_date: NaiveDate,
    pub return_seq:  i64,
}

/// What a pass needs to fold in returns and late-fee payments, read from
/// one snapshot of the database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReturnsSnapshot {
    pub returns_through_seq: i64,
    /// Loans returned after `returns_through_seq`, in sequence order.
    pub returns:             Vec<ReturnedLoanRow>,
    /// Total late-fee payments per loan, for every loan in `returns` and
    /// every loan paid since `payments_through_id`.
    pub late_fee_paid:       HashMap<LoanId, f64>,
    /// Loans with a late-fee payment after `payments_through_id`.
    pub newly_paid:          Vec<LoanId>,
    pub payments_through_id: i64,
    /// Highest payment id visible in the snapshot.
    pub last_payment_id:     i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeTotalsRow {
    pub customer_id: CustomerId,
    pub outstanding: f64,
    pub total:       f64,
    pub paid:        f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenLoanStatsRow {
    pub customer_id:       CustomerId,
    pub open_loans:        i64,
    pub overdue_loans:     i64,
    pub oldest_open_start: NaiveDate,
}
