use super::{shard_filter, CustomerLifecycleRow, SimStore};
use crate::{
    config::ShardConfig,
    error::SimResult,
    types::{ActivityStatus, CustomerId, Step},
};
use chrono::NaiveDate;
use rusqlite::{named_params, params, OptionalExtension};

const LIFECYCLE_COLUMNS: &str = "customer_id, joined_on, status, last_transaction_on, inactivity_streak, loyal,
     joined_step, begun_step, settled_step";

fn step_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Step>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|s| s.max(0) as Step))
}

fn map_lifecycle_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomerLifecycleRow> {
    Ok(CustomerLifecycleRow {
        customer_id:         row.get(0)?,
        joined_on:           row.get(1)?,
        status:              row.get(2)?,
        last_transaction_on: row.get(3)?,
        inactivity_streak:   row.get::<_, i64>(4)?.max(0) as u32,
        loyal:               row.get(5)?,
        joined_step:         step_column(row, 6)?,
        begun_step:          step_column(row, 7)?,
        settled_step:        step_column(row, 8)?,
    })
}

impl SimStore {
    /// New customers always enter active.
    pub fn insert_customer(&self, joined_on: NaiveDate, loyal: bool) -> SimResult<CustomerId> {
        self.conn.execute(
            "INSERT INTO customer_lifecycle (joined_on, status, inactivity_streak, loyal)
             VALUES (?1, 'active', 0, ?2)",
            params![joined_on, loyal],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert a customer onboarded during `step`.
    pub fn onboard_customer(&self, joined_on: NaiveDate, loyal: bool, step: Step) -> SimResult<CustomerId> {
        self.conn.execute(
            "INSERT INTO customer_lifecycle (joined_on, status, inactivity_streak, loyal, joined_step)
             VALUES (?1, 'active', 0, ?2, ?3)",
            params![joined_on, loyal, step as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Customers onboarded during `step`, across all shards.
    pub fn customers_joined_in_step(&self, step: Step) -> SimResult<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM customer_lifecycle WHERE joined_step = ?1",
            params![step as i64],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    pub fn lifecycle_rows(&self, shard: ShardConfig) -> SimResult<Vec<CustomerLifecycleRow>> {
        let sql = format!(
            "SELECT {LIFECYCLE_COLUMNS} FROM customer_lifecycle
             WHERE {} ORDER BY customer_id",
            shard_filter("customer_id"),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                named_params! { ":shard_count": shard.count, ":shard_index": shard.index },
                map_lifecycle_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_customer_lifecycle(&self, customer_id: CustomerId) -> SimResult<Option<CustomerLifecycleRow>> {
        let sql = format!("SELECT {LIFECYCLE_COLUMNS} FROM customer_lifecycle WHERE customer_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![customer_id], map_lifecycle_row)
            .optional()?;
        Ok(row)
    }

    /// Persist a batch of lifecycle states, with their step markers, in one
    /// transaction.
    pub fn save_lifecycle_rows(&self, rows: &[CustomerLifecycleRow]) -> SimResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.write_tx()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE customer_lifecycle
                 SET status = ?1, last_transaction_on = ?2, inactivity_streak = ?3,
                     begun_step = ?4, settled_step = ?5
                 WHERE customer_id = ?6",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.status,
                    row.last_transaction_on,
                    row.inactivity_streak,
                    row.begun_step.map(|s| s as i64),
                    row.settled_step.map(|s| s as i64),
                    row.customer_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn lifecycle_count_by_status(&self, status: ActivityStatus) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM customer_lifecycle WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn customer_count(&self) -> SimResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM customer_lifecycle", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn all_customer_ids(&self) -> SimResult<Vec<CustomerId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT customer_id FROM customer_lifecycle ORDER BY customer_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}
