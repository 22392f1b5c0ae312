//! Daily balance job: bank snapshots and merchant balances into the "Daily Balance" spreadsheet.

use std::fmt;

use crate::{
    config::{DbConfig, SheetsConfig},
    db::{BalanceStore, DbError, MerchantBalance, PgStore},
    google_sheets::GoogleSheets,
    local_time::snapshot_minute,
    looping::{Job, JobOutcome},
    numeric::to_cell_number,
    sheet::{CellValue, SheetClient, SheetError},
};

pub const SNAPSHOT_SHEET: &str = "IUGU Subcontas";
pub const MERCHANT_SHEET: &str = "jaci";
/// Rows blanked in the merchant sheet before writing, matching the query limit.
pub const MERCHANT_ROWS: usize = 1000;

const COL_ID: usize = 0;
const COL_MIN_BALANCE: usize = 1;
const COL_CURRENT_BALANCE: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("query failed: {0}")]
    Db(#[from] DbError),
    #[error("sheet update failed: {0}")]
    Sheet(#[from] SheetError),
}

/// The steps that failed in one iteration, in order.
#[derive(Debug)]
pub struct FailedSteps(pub Vec<(&'static str, StepError)>);

impl fmt::Display for FailedSteps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(step, err)| format!("{step}: {err}"))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BalanceSyncError {
    #[error("Database connection failed: {0}")]
    Connect(DbError),
    #[error("Sheets client setup failed: {0}")]
    Sheets(SheetError),
    #[error("{0} update step(s) failed: {1}")]
    Steps(usize, FailedSteps),
}

/// Writes the newest balance of `bank` to `balance_cell`, and the snapshot time to `time_cell` if given.
fn snapshot_bank<C: SheetClient>(
    store: &mut impl BalanceStore,
    sheets: &C,
    bank: &str,
    balance_cell: &str,
    time_cell: Option<&str>,
) -> Result<(), StepError> {
    let Some(snapshot) = store.latest_bank_balance(bank)? else {
        log::info!("No balance found for {bank}");
        return Ok(());
    };
    let balance = snapshot.balance.clone().unwrap_or_default();
    sheets.update_value(SNAPSHOT_SHEET, balance_cell, CellValue::Text(balance.clone()))?;
    let minute = snapshot_minute(snapshot.taken_at);
    if let Some(time_cell) = time_cell {
        sheets.update_value(SNAPSHOT_SHEET, time_cell, CellValue::Text(minute.clone()))?;
    }
    log::info!("{bank} snapshot updated: balance={balance}, taken at {minute}");
    Ok(())
}

fn numeric_column(rows: &[MerchantBalance]) -> Vec<CellValue> {
    rows.iter()
        .map(|row| to_cell_number(row.balance.as_deref()))
        .collect()
}

/// Rewrites ids (column A) and minimum balances (column B) of the merchant sheet.
fn sync_min_balances<C: SheetClient>(
    store: &mut impl BalanceStore,
    sheets: &C,
) -> Result<(), StepError> {
    let rows = store.merchant_min_balances()?;
    if rows.is_empty() {
        log::info!("No merchant balances found");
        return Ok(());
    }
    log::info!("Clearing previous data of {MERCHANT_SHEET}...");
    sheets.clear_column(MERCHANT_SHEET, COL_ID, MERCHANT_ROWS)?;
    sheets.clear_column(MERCHANT_SHEET, COL_MIN_BALANCE, MERCHANT_ROWS)?;

    let ids = rows.iter().map(|row| CellValue::Text(row.id.clone())).collect();
    sheets.write_column(MERCHANT_SHEET, COL_ID, 1, ids)?;
    sheets.write_column(MERCHANT_SHEET, COL_MIN_BALANCE, 1, numeric_column(&rows))?;
    log::info!("Merchant balances updated in {MERCHANT_SHEET}: {} rows", rows.len());
    Ok(())
}

/// Writes the current balance of each merchant to column C (`saldo_atual`).
fn sync_current_balances<C: SheetClient>(
    store: &mut impl BalanceStore,
    sheets: &C,
) -> Result<(), StepError> {
    let rows = store.merchant_balances()?;
    if rows.is_empty() {
        log::info!("No current balances to update");
        return Ok(());
    }
    sheets.write_column(MERCHANT_SHEET, COL_CURRENT_BALANCE, 1, numeric_column(&rows))?;
    log::info!("Column saldo_atual updated with {} rows", rows.len());
    Ok(())
}

/// Runs every update step. A failing step is logged and the next one still runs;
/// the iteration fails if any step did.
pub fn sync_balances<C: SheetClient>(
    store: &mut impl BalanceStore,
    sheets: &C,
) -> Result<JobOutcome, BalanceSyncError> {
    let mut failed = Vec::new();
    let mut record = |step: &'static str, res: Result<(), StepError>| {
        if let Err(err) = res {
            log::error!("Step {step} failed: {err}");
            failed.push((step, err));
        }
    };

    log::info!("Updating account snapshots...");
    record("transfeera", snapshot_bank(store, sheets, "transfeera", "E3", Some("B1")));
    record("sqala", snapshot_bank(store, sheets, "sqala", "F3", None));
    log::info!("Updating merchant balances...");
    record("merchant_balances", sync_min_balances(store, sheets));
    record("saldo_atual", sync_current_balances(store, sheets));

    if failed.is_empty() {
        log::info!("All updates finished successfully!");
        Ok(JobOutcome::Updated)
    } else {
        Err(BalanceSyncError::Steps(failed.len(), FailedSteps(failed)))
    }
}

pub struct DailyBalanceJob {
    db: DbConfig,
    sheets: GoogleSheets,
}

impl DailyBalanceJob {
    pub fn new(db: DbConfig, sheets: &SheetsConfig) -> Result<Self, BalanceSyncError> {
        Ok(Self {
            db,
            sheets: GoogleSheets::new(sheets).map_err(BalanceSyncError::Sheets)?,
        })
    }
}

impl Job for DailyBalanceJob {
    type Error = BalanceSyncError;

    fn name(&self) -> &'static str {
        "daily-balance"
    }

    fn run(&mut self) -> Result<JobOutcome, BalanceSyncError> {
        let mut store = PgStore::connect(&self.db).map_err(BalanceSyncError::Connect)?;
        let res = sync_balances(&mut store, &self.sheets);
        drop(store);
        log::debug!("Database connection closed.");
        res
    }

    fn is_rate_limited(err: &BalanceSyncError) -> bool {
        match err {
            BalanceSyncError::Steps(_, FailedSteps(steps)) => steps
                .iter()
                .any(|(_, e)| matches!(e, StepError::Sheet(s) if s.is_rate_limited())),
            _ => false,
        }
    }
}
