//! IUGU sub-account balances, fetched with `curl` through an SSH tunnel.
//!
//! The IUGU API only accepts calls from an allow-listed host, so every request runs
//! `curl` on that host over `ssh`. The tunnel refuses connections when it's hammered,
//! which is reported the same way as an HTTP 429.

use std::{
    io::Write,
    path::Path,
    process::{Command, ExitStatus, Stdio},
    rc::Rc,
    time::Duration,
};

use serde::Deserialize;
use serde_json::Value;

use crate::{numeric::parse_brl, rate_limit::SlidingWindowLimiter};

const API_BASE: &str = "https://api.iugu.com/v1";
const CURL_MAX_TIME_SECS: u32 = 30;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IuguAccount {
    pub name: String,
    pub account_id: String,
    pub api_token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountsError {
    #[error("Failed to read accounts file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Accounts file is not a valid account list: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reads the JSON list of sub-accounts to poll.
pub fn load_accounts(path: &Path) -> Result<Vec<IuguAccount>, AccountsError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Wraps the failure of running the curl command, before any HTTP status is known.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Spawning the command failed
    #[error("Failed to execute curl command {0}")]
    Exec(#[from] std::io::Error),
    /// ssh refused the connection, assumed to be the tunnel's connection limit.
    #[error("Tunnel limit of connections reached")]
    LimitReached(Rc<str>),
    /// The command ran but exited with a non-zero status code
    #[error("Unknown curl error occured: status={0}, stderr={1:?}")]
    Other(ExitStatus, Rc<str>),
    #[error("curl output has no status line: {0:?}")]
    Malformed(Rc<str>),
}

pub trait Transport {
    /// `GET {API_BASE}/{path}` authenticated with `api_token`.
    fn get(&self, path: &str, api_token: &str) -> Result<HttpReply, TransportError>;
}

/// Runs curl on `ssh_host`, or locally when no host is configured.
pub struct SshCurl {
    ssh_host: Option<String>,
}

impl SshCurl {
    pub fn new(ssh_host: Option<String>) -> Self {
        Self { ssh_host }
    }

    /// The token is handed to curl as a config file on stdin (`-K -`) so it never shows
    /// up in the process list of either host.
    fn curl_args(path: &str) -> Vec<String> {
        vec![
            "-sS".to_owned(),
            "--max-time".to_owned(),
            CURL_MAX_TIME_SECS.to_string(),
            "-K".to_owned(),
            "-".to_owned(),
            "-w".to_owned(),
            "\n%{http_code}".to_owned(),
            format!("{API_BASE}/{}", path.trim_start_matches('/')),
        ]
    }

    fn command(&self, path: &str) -> Command {
        let args = Self::curl_args(path);
        match &self.ssh_host {
            Some(host) => {
                let remote = std::iter::once("curl".to_owned())
                    .chain(args.iter().map(|a| shell_quote(a)))
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut command = Command::new("ssh");
                command.args(["-o", "BatchMode=yes", host.as_str(), remote.as_str()]);
                command
            }
            None => {
                let mut command = Command::new("curl");
                command.args(&args);
                command
            }
        }
    }
}

/// curl config read from stdin: basic auth with the token as user and no password.
fn curl_config(api_token: &str) -> String {
    let escaped = api_token.replace('\\', "\\\\").replace('"', "\\\"");
    format!("user = \"{escaped}:\"\n")
}

/// Quotes `arg` for the remote shell ssh hands the command to.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Splits curl's output into body and the status written by `-w "\n%{http_code}"`.
fn parse_curl_output(stdout: &str) -> Result<HttpReply, TransportError> {
    let (body, status) = stdout.rsplit_once('\n').unwrap_or(("", stdout));
    let status = status
        .trim()
        .parse()
        .map_err(|_| TransportError::Malformed(stdout.into()))?;
    Ok(HttpReply {
        status,
        body: body.to_owned(),
    })
}

impl Transport for SshCurl {
    fn get(&self, path: &str, api_token: &str) -> Result<HttpReply, TransportError> {
        let mut child = self
            .command(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(curl_config(api_token).as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            parse_curl_output(&String::from_utf8_lossy(&output.stdout))
        } else {
            let stderr: Rc<str> = String::from_utf8_lossy(&output.stderr).into();
            Err(
                if stderr.contains("Connection refused") && stderr.contains("ssh:") {
                    TransportError::LimitReached(stderr)
                } else {
                    TransportError::Other(output.status, stderr)
                },
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub max_retries: u32,
    pub batch_pause: Duration,
    pub retry_backoff: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        source: TransportError,
    },
    #[error("IUGU answered {status} after {attempts} attempt(s): {body}")]
    Status {
        status: u16,
        attempts: u32,
        body: String,
    },
    #[error("unexpected IUGU response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            FetchError::Status { status: 429, .. }
                | FetchError::Transport {
                    source: TransportError::LimitReached(_),
                    ..
                }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubaccountBalance {
    pub balance: Option<f64>,
    pub available_for_withdraw: Option<f64>,
    pub receivable: Option<f64>,
}

fn money(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::String(text) => parse_brl(text),
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

pub fn parse_balance(body: &str) -> Result<SubaccountBalance, serde_json::Error> {
    let account: Value = serde_json::from_str(body)?;
    Ok(SubaccountBalance {
        balance: money(account.get("balance")),
        available_for_withdraw: money(account.get("balance_available_for_withdraw")),
        receivable: money(account.get("receivable_balance")),
    })
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

fn retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Fetches one account, retrying tunnel failures, 429 and 5xx with linear backoff.
pub fn fetch_balance(
    account: &IuguAccount,
    transport: &impl Transport,
    limiter: &SlidingWindowLimiter,
    policy: &BatchPolicy,
) -> Result<SubaccountBalance, FetchError> {
    let path = format!("accounts/{}", account.account_id);
    let mut attempt = 0;
    loop {
        attempt += 1;
        limiter.acquire();
        let err = match transport.get(&path, &account.api_token) {
            Ok(reply) if (200..300).contains(&reply.status) => {
                return Ok(parse_balance(&reply.body)?);
            }
            Ok(reply) => {
                let retry = retryable_status(reply.status);
                let err = FetchError::Status {
                    status: reply.status,
                    attempts: attempt,
                    body: reply.body,
                };
                if !retry {
                    return Err(err);
                }
                err
            }
            Err(source) => FetchError::Transport {
                attempts: attempt,
                source,
            },
        };
        if attempt > policy.max_retries {
            return Err(err);
        }
        let wait = policy.retry_backoff * attempt;
        log::warn!(
            "Fetching {} failed ({err}), retry {attempt} of {} in {wait:?}",
            account.name,
            policy.max_retries
        );
        pause(wait);
    }
}

/// Fetches every account, `batch_size` at a time with a pause between batches.
/// Results keep the order of `accounts`.
pub fn fetch_balances<'a>(
    accounts: &'a [IuguAccount],
    transport: &impl Transport,
    limiter: &SlidingWindowLimiter,
    policy: &BatchPolicy,
) -> Vec<(&'a IuguAccount, Result<SubaccountBalance, FetchError>)> {
    let batch_size = policy.batch_size.max(1);
    let batches = accounts.len().div_ceil(batch_size);
    let mut results = Vec::with_capacity(accounts.len());
    for (i, batch) in accounts.chunks(batch_size).enumerate() {
        log::debug!("Fetching IUGU batch {} of {batches} ({} accounts)", i + 1, batch.len());
        for account in batch {
            let res = fetch_balance(account, transport, limiter, policy);
            match &res {
                Ok(balance) => log::debug!("{}: {balance:?}", account.name),
                Err(err) => log::error!("Fetching {} failed: {err}", account.name),
            }
            results.push((account, res));
        }
        if i + 1 < batches {
            pause(policy.batch_pause);
        }
    }
    results
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, collections::VecDeque};

    use super::*;

    /// Replies scripted per account path; unscripted calls answer 404.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub replies: RefCell<Vec<(String, VecDeque<Result<HttpReply, TransportError>>)>>,
        pub calls: RefCell<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn script(&self, account_id: &str, replies: Vec<Result<HttpReply, TransportError>>) {
            self.replies
                .borrow_mut()
                .push((format!("accounts/{account_id}"), replies.into()));
        }
    }

    impl Transport for ScriptedTransport {
        fn get(&self, path: &str, _api_token: &str) -> Result<HttpReply, TransportError> {
            self.calls.borrow_mut().push(path.to_owned());
            let mut replies = self.replies.borrow_mut();
            replies
                .iter_mut()
                .find(|(p, _)| p == path)
                .and_then(|(_, queue)| queue.pop_front())
                .unwrap_or(Ok(reply(404, "{}")))
        }
    }

    pub fn reply(status: u16, body: &str) -> HttpReply {
        HttpReply {
            status,
            body: body.to_owned(),
        }
    }

    pub fn account(id: &str) -> IuguAccount {
        IuguAccount {
            name: format!("sub {id}"),
            account_id: id.to_owned(),
            api_token: "tok".to_owned(),
        }
    }

    pub fn policy() -> BatchPolicy {
        BatchPolicy {
            batch_size: 2,
            max_retries: 2,
            batch_pause: Duration::ZERO,
            retry_backoff: Duration::ZERO,
        }
    }

    fn limiter() -> SlidingWindowLimiter {
        SlidingWindowLimiter::per_minute(1000)
    }

    #[test]
    fn parses_brl_and_numeric_balances() {
        let balance = parse_balance(
            r#"{"balance": "R$ 1.000,50", "balance_available_for_withdraw": 20.5, "receivable_balance": null}"#,
        )
        .unwrap();
        assert_eq!(
            balance,
            SubaccountBalance {
                balance: Some(1000.5),
                available_for_withdraw: Some(20.5),
                receivable: None,
            }
        );
        assert!(parse_balance("not json").is_err());
    }

    #[test]
    fn curl_output_split() {
        assert_eq!(parse_curl_output("{\"a\":1}\n200").unwrap(), reply(200, "{\"a\":1}"));
        assert_eq!(parse_curl_output("line1\nline2\n503").unwrap(), reply(503, "line1\nline2"));
        assert_eq!(parse_curl_output("429").unwrap(), reply(429, ""));
        assert!(matches!(parse_curl_output("oops"), Err(TransportError::Malformed(_))));
    }

    #[test]
    fn ssh_command_quotes_remote_arguments() {
        let command = SshCurl::new(Some("tunnel".into())).command("it's/abc");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(command.get_program(), "ssh");
        assert_eq!(&args[..3], ["-o", "BatchMode=yes", "tunnel"]);
        assert!(args[3].starts_with("curl '-sS' '--max-time' '30' '-K' '-'"));
        assert!(args[3].ends_with("'https://api.iugu.com/v1/it'\\''s/abc'"));

        let local = SshCurl::new(None).command("accounts/abc");
        assert_eq!(local.get_program(), "curl");
    }

    #[test]
    fn token_stays_off_the_command_line() {
        let command = SshCurl::new(Some("tunnel".into())).command("accounts/abc");
        assert!(command.get_args().all(|a| !a.to_string_lossy().contains("secret")));
        assert_eq!(curl_config("secret"), "user = \"secret:\"\n");
        assert_eq!(curl_config(r#"a"b\c"#), "user = \"a\\\"b\\\\c:\"\n");
    }

    #[test]
    fn retries_rate_limits_then_succeeds() {
        let transport = ScriptedTransport::default();
        transport.script(
            "a",
            vec![
                Ok(reply(429, "slow down")),
                Err(TransportError::LimitReached("ssh: connect: Connection refused".into())),
                Ok(reply(200, r#"{"balance": "R$ 5,00"}"#)),
            ],
        );
        let balance = fetch_balance(&account("a"), &transport, &limiter(), &policy()).unwrap();
        assert_eq!(balance.balance, Some(5.0));
        assert_eq!(transport.calls.borrow().len(), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let transport = ScriptedTransport::default();
        transport.script("a", (0..5).map(|_| Ok(reply(503, "down"))).collect());
        let err = fetch_balance(&account("a"), &transport, &limiter(), &policy()).unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, attempts: 3, .. }));
        assert_eq!(transport.calls.borrow().len(), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::default();
        let err = fetch_balance(&account("missing"), &transport, &limiter(), &policy()).unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, attempts: 1, .. }));
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn one_failure_does_not_abort_the_batch() {
        let transport = ScriptedTransport::default();
        transport.script("1", vec![Ok(reply(200, r#"{"balance": "R$ 1,00"}"#))]);
        transport.script("3", vec![Ok(reply(200, r#"{"balance": 3}"#))]);
        let accounts = vec![account("1"), account("2"), account("3")];
        let results = fetch_balances(&accounts, &transport, &limiter(), &policy());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].1.as_ref().unwrap().balance, Some(1.0));
        assert!(results[1].1.is_err());
        assert_eq!(results[2].0.account_id, "3");
        assert_eq!(results[2].1.as_ref().unwrap().balance, Some(3.0));
    }

    #[test]
    fn accounts_file_is_a_json_list() {
        let path = std::env::temp_dir().join(format!("iugu_accounts_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"[{"name": "Loja", "account_id": "ABC", "api_token": "secret"}]"#,
        )
        .unwrap();
        let accounts = load_accounts(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(accounts, vec![IuguAccount {
            name: "Loja".into(),
            account_id: "ABC".into(),
            api_token: "secret".into(),
        }]);
        assert!(matches!(load_accounts(&path), Err(AccountsError::Read(_))));
    }
}
