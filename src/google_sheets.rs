use std::{
    process::Command,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use reqwest::{
    StatusCode, Url,
    blocking::{Client, RequestBuilder, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    config::SheetsConfig,
    rate_limit::SlidingWindowLimiter,
    sheet::{CellValue, SheetClient, SheetError, qualified},
};

const API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
/// Access tokens are valid for an hour; refresh a bit earlier.
const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// [SheetClient] backed by the Google Sheets v4 REST API.
pub struct GoogleSheets {
    client: Client,
    api_base: String,
    spreadsheet_id: String,
    token_command: String,
    token: Mutex<Option<(String, Instant)>>,
    limiter: Arc<SlidingWindowLimiter>,
}

impl GoogleSheets {
    pub fn new(config: &SheetsConfig) -> Result<Self, SheetError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            api_base: API_BASE.to_owned(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            token_command: config.token_command.clone(),
            token: Mutex::new(None),
            limiter: Arc::new(SlidingWindowLimiter::per_minute(config.writes_per_minute)),
        })
    }

    fn values_url(&self, sheet: &str, range: &str) -> Result<Url, SheetError> {
        let mut url =
            Url::parse(&self.api_base).map_err(|e| SheetError::Malformed(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SheetError::Malformed(self.api_base.clone()))?
            .extend([
                self.spreadsheet_id.as_str(),
                "values",
                qualified(sheet, range).as_str(),
            ]);
        Ok(url)
    }

    fn access_token(&self) -> Result<String, SheetError> {
        let mut cached = self.token.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((token, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < TOKEN_TTL {
                return Ok(token.clone());
            }
        }
        log::debug!("Fetching a new sheets access token");
        let token = run_token_command(&self.token_command)?;
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    fn forget_token(&self) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Sends the request built by `build`, refreshing the token once if it was rejected.
    fn send(&self, build: impl Fn(&str) -> RequestBuilder) -> Result<Response, SheetError> {
        self.limiter.acquire();
        let mut response = build(&self.access_token()?).send()?;
        if response.status() == StatusCode::UNAUTHORIZED {
            log::warn!("Sheets API rejected the access token, fetching a new one");
            self.forget_token();
            self.limiter.acquire();
            response = build(&self.access_token()?).send()?;
        }
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            Err(SheetError::Status { status, body })
        }
    }
}

fn run_token_command(command: &str) -> Result<String, SheetError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| SheetError::Token(e.to_string()))?;
    if !output.status.success() {
        return Err(SheetError::Token(format!(
            "status={}, stderr={:?}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if token.is_empty() {
        return Err(SheetError::Token("command printed no token".to_owned()));
    }
    Ok(token)
}

impl SheetClient for GoogleSheets {
    fn get_value(&self, sheet: &str, cell: &str) -> Result<String, SheetError> {
        let url = self.values_url(sheet, cell)?;
        let range: ValueRange = self
            .send(|token| self.client.get(url.clone()).bearer_auth(token))?
            .json()?;
        let value = range
            .values
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next());
        Ok(match value {
            None => String::new(),
            Some(serde_json::Value::String(text)) => text,
            Some(other) => other.to_string(),
        })
    }

    fn update_values(
        &self,
        sheet: &str,
        range: &str,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<(), SheetError> {
        let url = self.values_url(sheet, range)?;
        let body = json!({
            "range": qualified(sheet, range),
            "majorDimension": "ROWS",
            "values": rows
                .iter()
                .map(|row| row.iter().map(CellValue::to_json).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
        });
        self.send(|token| {
            self.client
                .put(url.clone())
                .query(&[("valueInputOption", "USER_ENTERED")])
                .bearer_auth(token)
                .json(&body)
        })?;
        log::trace!("Updated {} rows at {sheet}!{range}", rows.len());
        Ok(())
    }
}
