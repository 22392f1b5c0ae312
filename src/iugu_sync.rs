use std::path::PathBuf;

use crate::{
    balance_sync::SNAPSHOT_SHEET,
    config::{IuguConfig, SheetsConfig},
    google_sheets::GoogleSheets,
    iugu::{
        AccountsError, BatchPolicy, FetchError, IuguAccount, SshCurl, SubaccountBalance,
        Transport, fetch_balances, load_accounts,
    },
    local_time::{now_sao_paulo, status_stamp},
    looping::{Job, JobOutcome},
    rate_limit::SlidingWindowLimiter,
    sheet::{CellValue, SheetClient, SheetError},
};

/// The sub-account table starts below the bank snapshot cells.
const TABLE_ROW: usize = 5;
/// Rows below the header blanked before each write, so removed accounts don't linger.
const CLEARED_ROWS: usize = 200;
const HEADER: [&str; 7] = [
    "Subconta",
    "ID",
    "Saldo",
    "Disponível para saque",
    "A receber",
    "Atualizado em",
    "Erro",
];

#[derive(Debug, thiserror::Error)]
pub enum IuguSyncError {
    #[error("Sheets client setup failed: {0}")]
    Setup(SheetError),
    #[error("Loading IUGU accounts failed: {0}")]
    Accounts(#[from] AccountsError),
    #[error("All {failed} IUGU accounts failed (rate limited: {rate_limited})")]
    AllFailed { failed: usize, rate_limited: bool },
    #[error("Writing sub-account balances failed: {0}")]
    Write(#[from] SheetError),
    /// The table was written but some accounts hit a rate limit, so the loop should slow down.
    #[error("{limited} of {total} IUGU accounts were rate limited")]
    RateLimited { limited: usize, total: usize },
}

fn table_row(
    account: &IuguAccount,
    result: &Result<SubaccountBalance, FetchError>,
    stamp: &str,
) -> Vec<CellValue> {
    let mut line = vec![
        CellValue::Text(account.name.clone()),
        CellValue::Text(account.account_id.clone()),
    ];
    match result {
        Ok(balance) => {
            line.push(balance.balance.into());
            line.push(balance.available_for_withdraw.into());
            line.push(balance.receivable.into());
            line.push(CellValue::Text(stamp.to_owned()));
            line.push(CellValue::Empty);
        }
        Err(err) => {
            line.extend([CellValue::Empty, CellValue::Empty, CellValue::Empty]);
            line.push(CellValue::Text(stamp.to_owned()));
            line.push(CellValue::Text(err.to_string()));
        }
    }
    line
}

/// Polls every account and writes one row each. Fails when no account could be read,
/// and reports [IuguSyncError::RateLimited] after writing if any account was throttled.
pub fn sync_subaccounts<C: SheetClient>(
    accounts: &[IuguAccount],
    transport: &impl Transport,
    limiter: &SlidingWindowLimiter,
    policy: &BatchPolicy,
    sheets: &C,
) -> Result<JobOutcome, IuguSyncError> {
    if accounts.is_empty() {
        log::info!("No IUGU accounts configured");
        return Ok(JobOutcome::Skipped);
    }
    let results = fetch_balances(accounts, transport, limiter, policy);
    let failed: Vec<&FetchError> = results.iter().filter_map(|(_, r)| r.as_ref().err()).collect();
    if failed.len() == results.len() {
        return Err(IuguSyncError::AllFailed {
            failed: failed.len(),
            rate_limited: failed.iter().any(|e| e.is_rate_limited()),
        });
    }

    let stamp = status_stamp(now_sao_paulo());
    let rows = results
        .iter()
        .map(|(account, result)| table_row(account, result, &stamp))
        .collect();
    sheets.clear_block(SNAPSHOT_SHEET, TABLE_ROW, 0, HEADER.len(), CLEARED_ROWS + 1)?;
    sheets.write_table(SNAPSHOT_SHEET, TABLE_ROW, 0, &HEADER, rows)?;
    log::info!(
        "IUGU sub-accounts updated: {} ok, {} failed",
        results.len() - failed.len(),
        failed.len()
    );
    let limited = failed.iter().filter(|e| e.is_rate_limited()).count();
    if limited > 0 {
        return Err(IuguSyncError::RateLimited {
            limited,
            total: results.len(),
        });
    }
    Ok(JobOutcome::Updated)
}

pub struct IuguSyncJob {
    accounts_file: PathBuf,
    transport: SshCurl,
    limiter: SlidingWindowLimiter,
    policy: BatchPolicy,
    sheets: GoogleSheets,
}

impl IuguSyncJob {
    pub fn new(iugu: &IuguConfig, sheets: &SheetsConfig) -> Result<Self, IuguSyncError> {
        Ok(Self {
            accounts_file: iugu.accounts_file.clone(),
            transport: SshCurl::new(iugu.ssh_host.clone()),
            limiter: SlidingWindowLimiter::per_minute(iugu.requests_per_minute),
            policy: BatchPolicy {
                batch_size: iugu.batch_size,
                max_retries: iugu.max_retries,
                batch_pause: iugu.batch_pause,
                retry_backoff: iugu.retry_backoff,
            },
            sheets: GoogleSheets::new(sheets).map_err(IuguSyncError::Setup)?,
        })
    }
}

impl Job for IuguSyncJob {
    type Error = IuguSyncError;

    fn name(&self) -> &'static str {
        "iugu-sync"
    }

    fn run(&mut self) -> Result<JobOutcome, IuguSyncError> {
        let accounts = load_accounts(&self.accounts_file)?;
        log::debug!("Loaded {} IUGU accounts from {:?}", accounts.len(), self.accounts_file);
        sync_subaccounts(
            &accounts,
            &self.transport,
            &self.limiter,
            &self.policy,
            &self.sheets,
        )
    }

    fn is_rate_limited(err: &IuguSyncError) -> bool {
        match err {
            IuguSyncError::AllFailed { rate_limited, .. } => *rate_limited,
            IuguSyncError::RateLimited { .. } => true,
            IuguSyncError::Write(e) => e.is_rate_limited(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        iugu::{
            TransportError,
            tests::{ScriptedTransport, account, policy, reply},
        },
        sheet::memory::MemorySheets,
    };

    #[test]
    fn writes_one_row_per_account() {
        let transport = ScriptedTransport::default();
        transport.script("A1", vec![Ok(reply(200, r#"{"balance": "R$ 10,00", "receivable_balance": "R$ 2,50"}"#))]);
        let accounts = vec![account("A1"), account("B2")];
        let sheets = MemorySheets::default();

        let outcome = sync_subaccounts(
            &accounts,
            &transport,
            &SlidingWindowLimiter::per_minute(100),
            &policy(),
            &sheets,
        )
        .unwrap();
        assert_eq!(outcome, JobOutcome::Updated);

        assert_eq!(sheets.get(SNAPSHOT_SHEET, "A5"), CellValue::Text("Subconta".into()));
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "B6"), CellValue::Text("A1".into()));
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "C6"), CellValue::Number(10.0));
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "E6"), CellValue::Number(2.5));
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "G6"), CellValue::Empty);
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "C7"), CellValue::Empty);
        let CellValue::Text(err) = sheets.get(SNAPSHOT_SHEET, "G7") else {
            panic!("error column not written");
        };
        assert!(err.contains("404"));
    }

    #[test]
    fn all_rate_limited_is_reported() {
        let transport = ScriptedTransport::default();
        transport.script(
            "A1",
            (0..3)
                .map(|_| Err(TransportError::LimitReached("ssh: Connection refused".into())))
                .collect(),
        );
        let sheets = MemorySheets::default();
        let err = sync_subaccounts(
            &[account("A1")],
            &transport,
            &SlidingWindowLimiter::per_minute(100),
            &policy(),
            &sheets,
        )
        .unwrap_err();
        assert!(IuguSyncJob::is_rate_limited(&err));
        assert!(sheets.writes.borrow().is_empty());
    }

    #[test]
    fn no_accounts_is_skipped() {
        let outcome = sync_subaccounts(
            &[],
            &ScriptedTransport::default(),
            &SlidingWindowLimiter::per_minute(1),
            &policy(),
            &MemorySheets::default(),
        )
        .unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
    }

    #[test]
    fn partial_rate_limit_still_writes_then_slows_down() {
        let transport = ScriptedTransport::default();
        transport.script("A1", vec![Ok(reply(200, r#"{"balance": 7}"#))]);
        transport.script(
            "B2",
            (0..3)
                .map(|_| Err(TransportError::LimitReached("ssh: Connection refused".into())))
                .collect(),
        );
        let sheets = MemorySheets::default();
        let err = sync_subaccounts(
            &[account("A1"), account("B2")],
            &transport,
            &SlidingWindowLimiter::per_minute(100),
            &policy(),
            &sheets,
        )
        .unwrap_err();
        assert!(matches!(err, IuguSyncError::RateLimited { limited: 1, total: 2 }));
        assert!(IuguSyncJob::is_rate_limited(&err));
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "C6"), CellValue::Number(7.0));
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "C7"), CellValue::Empty);
    }

    #[test]
    fn rows_of_removed_accounts_are_cleared() {
        let transport = ScriptedTransport::default();
        transport.script("A1", vec![Ok(reply(200, r#"{"balance": 1}"#))]);
        let sheets = MemorySheets::default();
        sheets.set(SNAPSHOT_SHEET, "A7", "old account".into());
        sheets.set(SNAPSHOT_SHEET, "G40", "old error".into());
        sheets.set(SNAPSHOT_SHEET, "E3", "kept".into());

        sync_subaccounts(
            &[account("A1")],
            &transport,
            &SlidingWindowLimiter::per_minute(100),
            &policy(),
            &sheets,
        )
        .unwrap();
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "A7"), CellValue::Empty);
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "G40"), CellValue::Empty);
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "E3"), CellValue::Text("kept".into()));
        assert_eq!(sheets.get(SNAPSHOT_SHEET, "B6"), CellValue::Text("A1".into()));
    }
}
