//! Payment and withdrawal indicators per merchant, written to the "indicadores" worksheet
//! whenever someone flips its trigger cell to `TRUE`.

use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    config::{DbConfig, SheetsConfig},
    db::{DbError, IndicatorStore, MerchantFigure, MerchantKey, PgStore},
    google_sheets::GoogleSheets,
    local_time::{now_sao_paulo, status_stamp},
    looping::{Job, JobOutcome},
    sheet::{CellValue, SheetClient, SheetError},
    withdrawal_stats::{WithdrawalMetrics, recent_withdrawals, withdrawal_metrics},
};

pub const INDICATOR_SHEET: &str = "indicadores";
const STATUS_CELL: &str = "A1";
const TRIGGER_CELL: &str = "B1";
const TABLE_ROW: usize = 2;

/// Value columns after `merchant_id` and `merchant`, in sheet order.
pub const COLUMNS: [&str; 21] = [
    "volume",
    "media_pix_minuto",
    "quantidade_pix_dia",
    "volume_mensal",
    "taxa_conversao",
    "taxa_falha",
    "mean_1h_volume",
    "std_1h_volume",
    "mean_1h_quantidade",
    "std_1h_quantidade",
    "mean_12h_volume",
    "std_12h_volume",
    "mean_12h_quantidade",
    "std_12h_quantidade",
    "mean_1d_volume",
    "std_1d_volume",
    "mean_1d_quantidade",
    "std_1d_quantidade",
    "current_1h_withdrawals",
    "sum_12h_withdrawals",
    "sum_24h_withdrawals",
];

const VOLUME: usize = 0;
const PIX_PER_MINUTE: usize = 1;
const DAILY_PIX: usize = 2;
const MONTHLY_VOLUME: usize = 3;
const CONVERSION: usize = 4;
const FAIL: usize = 5;
const METRICS: usize = 6;
const RECENT: usize = 18;

type Row = [Option<f64>; COLUMNS.len()];

/// Indicator rows keyed by merchant, built by joining the individual query results.
#[derive(Debug, Default)]
pub struct IndicatorTable {
    rows: HashMap<MerchantKey, Row>,
}

/// Everything the table is built from.
#[derive(Debug, Default)]
pub struct IndicatorInputs {
    pub daily_revenue: Vec<MerchantFigure>,
    pub pix_per_minute: Vec<MerchantFigure>,
    pub daily_pix_count: Vec<MerchantFigure>,
    pub monthly_revenue: Vec<MerchantFigure>,
    pub conversion_rate: Vec<MerchantFigure>,
    pub fail_rate: Vec<MerchantFigure>,
    pub withdrawal_metrics: HashMap<MerchantKey, WithdrawalMetrics>,
    pub recent_withdrawals: HashMap<MerchantKey, [Option<f64>; 3]>,
}

fn index(figures: &[MerchantFigure]) -> HashMap<&MerchantKey, Option<f64>> {
    figures.iter().map(|f| (&f.key, f.value)).collect()
}

impl IndicatorTable {
    /// Daily revenue decides the initial merchants. Pix figures only fill existing rows
    /// (missing as 0); monthly revenue, conversion and fail rate add merchants of their own;
    /// withdrawal figures only fill existing rows.
    pub fn build(inputs: &IndicatorInputs) -> Self {
        let mut rows: HashMap<MerchantKey, Row> = HashMap::new();
        let pix = index(&inputs.pix_per_minute);
        let daily_pix = index(&inputs.daily_pix_count);
        for figure in &inputs.daily_revenue {
            let row = rows.entry(figure.key.clone()).or_insert([None; COLUMNS.len()]);
            row[VOLUME] = Some(figure.value.unwrap_or(0.0));
            row[PIX_PER_MINUTE] = Some(pix.get(&figure.key).copied().flatten().unwrap_or(0.0));
            row[DAILY_PIX] = Some(daily_pix.get(&figure.key).copied().flatten().unwrap_or(0.0));
        }

        for (column, figures) in [
            (MONTHLY_VOLUME, &inputs.monthly_revenue),
            (CONVERSION, &inputs.conversion_rate),
            (FAIL, &inputs.fail_rate),
        ] {
            for figure in figures {
                rows.entry(figure.key.clone()).or_insert([None; COLUMNS.len()])[column] =
                    figure.value;
            }
        }

        for (key, row) in rows.iter_mut() {
            if let Some(metrics) = inputs.withdrawal_metrics.get(key) {
                row[METRICS..RECENT].copy_from_slice(&metrics.0);
            }
            if let Some(recent) = inputs.recent_withdrawals.get(key) {
                row[RECENT..].copy_from_slice(recent);
            }
        }
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn header() -> Vec<&'static str> {
        ["merchant_id", "merchant"].into_iter().chain(COLUMNS).collect()
    }

    /// Rows ordered by merchant id (numerically when both ids are numbers), then name.
    pub fn to_cells(&self) -> Vec<Vec<CellValue>> {
        let mut keys: Vec<&MerchantKey> = self.rows.keys().collect();
        keys.sort_by(|a, b| compare_keys(a, b));
        keys.into_iter()
            .map(|key| {
                let mut line = vec![
                    CellValue::Text(key.merchant_id.clone()),
                    CellValue::Text(key.merchant.clone()),
                ];
                line.extend(self.rows[key].iter().map(|v| CellValue::from(*v)));
                line
            })
            .collect()
    }
}

fn compare_keys(a: &MerchantKey, b: &MerchantKey) -> Ordering {
    let by_id = match (a.merchant_id.parse::<i64>(), b.merchant_id.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.merchant_id.cmp(&b.merchant_id),
    };
    by_id.then_with(|| a.merchant.cmp(&b.merchant))
}

/// Runs every indicator query relative to `now`.
pub fn collect_inputs(
    store: &mut impl IndicatorStore,
    now: DateTime<Utc>,
) -> Result<IndicatorInputs, DbError> {
    let month_of_withdrawals = store.withdrawals(now - TimeDelta::days(30), now)?;
    let last_1h = store.withdrawals(now - TimeDelta::hours(1), now)?;
    let last_12h = store.withdrawals(now - TimeDelta::hours(12), now)?;
    let last_24h = store.withdrawals(now - TimeDelta::hours(24), now)?;
    log::debug!(
        "Withdrawal rows: 30d={}, 1h={}, 12h={}, 24h={}",
        month_of_withdrawals.len(),
        last_1h.len(),
        last_12h.len(),
        last_24h.len()
    );
    Ok(IndicatorInputs {
        daily_revenue: store.daily_revenue()?,
        pix_per_minute: store.pix_per_minute()?,
        daily_pix_count: store.daily_pix_count()?,
        monthly_revenue: store.monthly_revenue()?,
        conversion_rate: store.conversion_rate()?,
        fail_rate: store.fail_rate()?,
        withdrawal_metrics: withdrawal_metrics(&month_of_withdrawals),
        recent_withdrawals: recent_withdrawals(&last_1h, &last_12h, &last_24h),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum IndicatorsError {
    #[error("Sheets client setup failed: {0}")]
    Setup(SheetError),
    #[error("Reading the trigger cell failed: {0}")]
    Trigger(SheetError),
    #[error("Updating the status cell failed: {0}")]
    Status(SheetError),
    #[error("Database connection failed: {0}")]
    Connect(DbError),
    #[error("Indicator query failed: {0}")]
    Query(#[from] DbError),
    #[error("Writing the indicator table failed: {0}")]
    Write(SheetError),
    #[error("Resetting the trigger cell failed: {0}")]
    Reset(SheetError),
}

impl IndicatorsError {
    fn sheet_error(&self) -> Option<&SheetError> {
        match self {
            IndicatorsError::Setup(e)
            | IndicatorsError::Trigger(e)
            | IndicatorsError::Status(e)
            | IndicatorsError::Write(e)
            | IndicatorsError::Reset(e) => Some(e),
            IndicatorsError::Connect(_) | IndicatorsError::Query(_) => None,
        }
    }
}

pub fn trigger_is_set<C: SheetClient>(sheets: &C) -> Result<bool, IndicatorsError> {
    let status = sheets
        .get_value(INDICATOR_SHEET, TRIGGER_CELL)
        .map_err(IndicatorsError::Trigger)?;
    Ok(status.trim().eq_ignore_ascii_case("TRUE"))
}

fn set_status<C: SheetClient>(sheets: &C, status: String) -> Result<(), IndicatorsError> {
    sheets
        .update_value(INDICATOR_SHEET, STATUS_CELL, CellValue::Text(status))
        .map_err(IndicatorsError::Status)
}

/// One trigger driven run. `open_store` is only called once the trigger is on.
pub fn refresh_indicators<C, S>(
    sheets: &C,
    open_store: impl FnOnce() -> Result<S, DbError>,
    force: bool,
) -> Result<JobOutcome, IndicatorsError>
where
    C: SheetClient,
    S: IndicatorStore,
{
    if !force && !trigger_is_set(sheets)? {
        log::debug!("Trigger cell {INDICATOR_SHEET}!{TRIGGER_CELL} is not TRUE");
        return Ok(JobOutcome::Skipped);
    }
    set_status(sheets, "Atualizando...".to_owned())?;

    let res = (|| {
        let mut store = open_store().map_err(IndicatorsError::Connect)?;
        let inputs = collect_inputs(&mut store, Utc::now())?;
        let table = IndicatorTable::build(&inputs);
        sheets
            .write_table(
                INDICATOR_SHEET,
                TABLE_ROW,
                0,
                &IndicatorTable::header(),
                table.to_cells(),
            )
            .map_err(IndicatorsError::Write)?;
        log::info!("Indicators updated: {} merchants", table.len());
        set_status(
            sheets,
            format!("Última atualização: {}", status_stamp(now_sao_paulo())),
        )?;
        sheets
            .update_value(INDICATOR_SHEET, TRIGGER_CELL, "FALSE".into())
            .map_err(IndicatorsError::Reset)
    })();

    match res {
        Ok(()) => Ok(JobOutcome::Updated),
        Err(err) => {
            if let Err(status_err) = set_status(sheets, format!("Erro: {err}")) {
                log::warn!("Could not report the failure in the status cell: {status_err}");
            }
            Err(err)
        }
    }
}

pub struct IndicatorsJob {
    db: DbConfig,
    sheets: GoogleSheets,
    force: bool,
}

impl IndicatorsJob {
    pub fn new(db: DbConfig, sheets: &SheetsConfig, force: bool) -> Result<Self, IndicatorsError> {
        Ok(Self {
            db,
            sheets: GoogleSheets::new(sheets).map_err(IndicatorsError::Setup)?,
            force,
        })
    }
}

impl Job for IndicatorsJob {
    type Error = IndicatorsError;

    fn name(&self) -> &'static str {
        "indicators"
    }

    fn run(&mut self) -> Result<JobOutcome, IndicatorsError> {
        let db = &self.db;
        refresh_indicators(&self.sheets, || PgStore::connect(db), self.force)
    }

    fn is_rate_limited(err: &IndicatorsError) -> bool {
        err.sheet_error().is_some_and(SheetError::is_rate_limited)
    }
}
