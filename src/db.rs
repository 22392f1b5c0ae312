//! Read side of the jobs: the payments database.
//!
//! Money and id columns are cast to text or `float8` in SQL so the rows don't depend
//! on the exact column types of the Django schema.

use chrono::{DateTime, NaiveDateTime, Utc};
use postgres::{Client, NoTls, Row, types::FromSql};

use crate::config::DbConfig;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Failed to connect to the database: {0}")]
    Connect(postgres::Error),
    #[error("Query {query} failed: {source}")]
    Query {
        query: &'static str,
        source: postgres::Error,
    },
    /// A column didn't have the expected type or was unexpectedly NULL
    #[error("Query {query} returned an unreadable column {column}: {reason}")]
    Decode {
        query: &'static str,
        column: usize,
        reason: String,
    },
}

/// Reads column `idx` of `row` without panicking on a type mismatch or NULL.
fn column<'a, T: FromSql<'a>>(row: &'a Row, query: &'static str, idx: usize) -> Result<T, DbError> {
    row.try_get(idx).map_err(|source| DbError::Decode {
        query,
        column: idx,
        reason: source.to_string(),
    })
}

/// Newest balance row of one bank account.
#[derive(Debug, Clone, PartialEq)]
pub struct BankSnapshot {
    pub taken_at: DateTime<Utc>,
    pub balance: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MerchantBalance {
    pub id: String,
    pub balance: Option<String>,
}

/// Rows of every indicator are matched on id and name together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MerchantKey {
    pub merchant_id: String,
    pub merchant: String,
}

impl MerchantKey {
    pub fn new(merchant_id: impl Into<String>, merchant: impl Into<String>) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            merchant: merchant.into(),
        }
    }
}

/// One number per merchant, as returned by the indicator queries.
#[derive(Debug, Clone, PartialEq)]
pub struct MerchantFigure {
    pub key: MerchantKey,
    pub value: Option<f64>,
}

/// Paid PIXOUT withdrawals of a merchant within one São Paulo hour.
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalHour {
    pub key: MerchantKey,
    pub hour: NaiveDateTime,
    pub count: f64,
    pub volume: f64,
}

pub trait BalanceStore {
    fn latest_bank_balance(&mut self, bank: &str) -> Result<Option<BankSnapshot>, DbError>;
    /// `min(balance_decimal)` per merchant id, ordered by id, first 1000.
    fn merchant_min_balances(&mut self) -> Result<Vec<MerchantBalance>, DbError>;
    /// Current `balance_decimal` per merchant id, ordered by id, first 1000.
    fn merchant_balances(&mut self) -> Result<Vec<MerchantBalance>, DbError>;
}

pub trait IndicatorStore {
    fn pix_per_minute(&mut self) -> Result<Vec<MerchantFigure>, DbError>;
    fn daily_pix_count(&mut self) -> Result<Vec<MerchantFigure>, DbError>;
    fn daily_revenue(&mut self) -> Result<Vec<MerchantFigure>, DbError>;
    fn monthly_revenue(&mut self) -> Result<Vec<MerchantFigure>, DbError>;
    fn conversion_rate(&mut self) -> Result<Vec<MerchantFigure>, DbError>;
    fn fail_rate(&mut self) -> Result<Vec<MerchantFigure>, DbError>;
    fn withdrawals(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WithdrawalHour>, DbError>;
}

pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub fn connect(config: &DbConfig) -> Result<Self, DbError> {
        log::debug!("Connecting to PostgreSQL at {}:{}", config.host, config.port);
        let client = postgres::Config::new()
            .host(&config.host)
            .port(config.port)
            .dbname(&config.name)
            .user(&config.user)
            .password(&config.password)
            .connect(NoTls)
            .map_err(DbError::Connect)?;
        log::info!("Database connection established.");
        Ok(Self { client })
    }

    fn balances(&mut self, query: &'static str, sql: &str) -> Result<Vec<MerchantBalance>, DbError> {
        let rows = self
            .client
            .query(sql, &[])
            .map_err(|source| DbError::Query { query, source })?;
        rows.iter()
            .map(|row| -> Result<MerchantBalance, DbError> {
                Ok(MerchantBalance {
                    id: column(row, query, 0)?,
                    balance: column(row, query, 1)?,
                })
            })
            .collect()
    }

    fn figures(&mut self, query: &'static str, sql: &str) -> Result<Vec<MerchantFigure>, DbError> {
        let rows = self
            .client
            .query(sql, &[])
            .map_err(|source| DbError::Query { query, source })?;
        log::debug!("{query}: {} rows", rows.len());
        rows.iter()
            .map(|row| -> Result<MerchantFigure, DbError> {
                Ok(MerchantFigure {
                    key: MerchantKey::new(
                        column::<String>(row, query, 0)?,
                        column::<Option<String>>(row, query, 1)?.unwrap_or_default(),
                    ),
                    value: column(row, query, 2)?,
                })
            })
            .collect()
    }
}

impl BalanceStore for PgStore {
    fn latest_bank_balance(&mut self, bank: &str) -> Result<Option<BankSnapshot>, DbError> {
        const QUERY: &str = "latest_bank_balance";
        let row = self
            .client
            .query_opt(
                "SELECT date_time::timestamptz, balance::text
                 FROM public.core_bankbalance
                 WHERE account_bank_text = $1
                 ORDER BY date_time DESC
                 LIMIT 1",
                &[&bank],
            )
            .map_err(|source| DbError::Query {
                query: QUERY,
                source,
            })?;
        row.map(|row| -> Result<BankSnapshot, DbError> {
            Ok(BankSnapshot {
                taken_at: column(&row, QUERY, 0)?,
                balance: column(&row, QUERY, 1)?,
            })
        })
        .transpose()
    }

    fn merchant_min_balances(&mut self) -> Result<Vec<MerchantBalance>, DbError> {
        self.balances(
            "merchant_min_balances",
            "SELECT id::text, min(balance_decimal)::text
             FROM public.core_merchant
             GROUP BY id
             ORDER BY id ASC
             LIMIT 1000",
        )
    }

    fn merchant_balances(&mut self) -> Result<Vec<MerchantBalance>, DbError> {
        self.balances(
            "merchant_balances",
            "SELECT id::text, balance_decimal::text
             FROM public.core_merchant
             ORDER BY id ASC
             LIMIT 1000",
        )
    }
}

impl IndicatorStore for PgStore {
    fn pix_per_minute(&mut self) -> Result<Vec<MerchantFigure>, DbError> {
        self.figures(
            "pix_per_minute",
            "SELECT sub.merchant_id::text, cm.name_text, AVG(sub.contagem)::float8
             FROM (
                 SELECT cp.merchant_id,
                        DATE_TRUNC('minute', cp.created_at_date) AS minuto,
                        COUNT(*) AS contagem
                 FROM core_payment cp
                 WHERE cp.status_text = 'PAID'
                   AND cp.method_text IN ('PIX', 'PIXOUT')
                   AND cp.created_at_date >= NOW() - INTERVAL '1 hour'
                 GROUP BY cp.merchant_id, minuto
             ) sub
             JOIN core_merchant cm ON sub.merchant_id = cm.id
             GROUP BY sub.merchant_id, cm.name_text",
        )
    }

    fn daily_pix_count(&mut self) -> Result<Vec<MerchantFigure>, DbError> {
        self.figures(
            "daily_pix_count",
            "SELECT cp.merchant_id::text, cm.name_text, COUNT(*)::float8
             FROM core_payment cp
             JOIN core_merchant cm ON cm.id = cp.merchant_id
             WHERE cp.status_text = 'PAID'
               AND cp.method_text IN ('PIX', 'PIXOUT')
               AND cp.created_at_date >= CURRENT_DATE AT TIME ZONE 'America/Sao_Paulo'
             GROUP BY cp.merchant_id, cm.name_text",
        )
    }

    fn daily_revenue(&mut self) -> Result<Vec<MerchantFigure>, DbError> {
        self.figures(
            "daily_revenue",
            "SELECT cp.merchant_id::text, cm.name_text, SUM(cp.amount_decimal)::float8
             FROM core_payment cp
             JOIN core_merchant cm ON cm.id = cp.merchant_id
             WHERE cp.status_text = 'PAID'
               AND cp.method_text = 'FEE'
               AND cp.created_at_date >= CURRENT_DATE AT TIME ZONE 'America/Sao_Paulo'
             GROUP BY cp.merchant_id, cm.name_text",
        )
    }

    fn monthly_revenue(&mut self) -> Result<Vec<MerchantFigure>, DbError> {
        self.figures(
            "monthly_revenue",
            "SELECT cp.merchant_id::text, cm.name_text, SUM(cp.amount_decimal)::float8
             FROM core_payment cp
             JOIN core_merchant cm ON cm.id = cp.merchant_id
             WHERE cp.status_text = 'PAID'
               AND cp.method_text = 'FEE'
               AND cp.created_at_date >= DATE_TRUNC('month', NOW() AT TIME ZONE 'America/Sao_Paulo')
             GROUP BY cp.merchant_id, cm.name_text",
        )
    }

    fn conversion_rate(&mut self) -> Result<Vec<MerchantFigure>, DbError> {
        self.figures(
            "conversion_rate",
            "SELECT cp.merchant_id::text, cm.name_text,
                    (COUNT(CASE WHEN cp.status_text = 'PAID' THEN 1 END) * 1.0
                        / NULLIF(COUNT(*), 0))::float8
             FROM core_payment cp
             JOIN core_merchant cm ON cm.id = cp.merchant_id
             WHERE cp.created_at_date >= CURRENT_DATE AT TIME ZONE 'America/Sao_Paulo'
             GROUP BY cp.merchant_id, cm.name_text",
        )
    }

    fn fail_rate(&mut self) -> Result<Vec<MerchantFigure>, DbError> {
        self.figures(
            "fail_rate",
            "SELECT cp.merchant_id::text, cm.name_text,
                    (COUNT(CASE WHEN cp.status_text = 'FAIL' THEN 1 END) * 1.0
                        / NULLIF(COUNT(*), 0))::float8
             FROM core_payment cp
             JOIN core_merchant cm ON cm.id = cp.merchant_id
             WHERE cp.created_at_date >= CURRENT_DATE AT TIME ZONE 'America/Sao_Paulo'
             GROUP BY cp.merchant_id, cm.name_text",
        )
    }

    fn withdrawals(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WithdrawalHour>, DbError> {
        const QUERY: &str = "withdrawals";
        let rows = self
            .client
            .query(
                "SELECT cp.merchant_id::text,
                        DATE_TRUNC('hour', (cp.finalized_at_date AT TIME ZONE 'America/Sao_Paulo')::timestamp) AS data_hora,
                        cm.name_text,
                        COUNT(*)::float8,
                        COALESCE(SUM(cp.amount_decimal), 0)::float8
                 FROM core_payment cp
                 JOIN core_merchant cm ON cm.id = cp.merchant_id
                 WHERE cp.status_text = 'PAID'
                   AND cp.method_text = 'PIXOUT'
                   AND cp.finalized_at_date BETWEEN $1 AND $2
                 GROUP BY cp.merchant_id, data_hora, cm.name_text
                 ORDER BY cp.merchant_id, data_hora",
                &[&start, &end],
            )
            .map_err(|source| DbError::Query {
                query: QUERY,
                source,
            })?;
        rows.iter()
            .map(|row| -> Result<WithdrawalHour, DbError> {
                Ok(WithdrawalHour {
                    key: MerchantKey::new(
                        column::<String>(row, QUERY, 0)?,
                        column::<Option<String>>(row, QUERY, 2)?.unwrap_or_default(),
                    ),
                    hour: column(row, QUERY, 1)?,
                    count: column(row, QUERY, 3)?,
                    volume: column(row, QUERY, 4)?,
                })
            })
            .collect()
    }
}
