//! HTTP client for a Wolfram|Alpha-style "short answers" oracle.
//!
//! GET `{base}?i=<query>&appid=<id>` answers with plain text. HTTP 400/501 mean the engine
//! could not interpret the query; that is reported as `OracleAnswer::Unparseable`, not as a failure.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::error::ServiceError;
use crate::services::{OracleAnswer, SymbolicOracle};
use crate::util::trunc_for_log;

const SERVICE: &str = "symbolic oracle";
const NOT_UNDERSTOOD: &str = "did not understand";

#[derive(Clone)]
pub struct HttpOracle {
  client: reqwest::Client,
  app_id: String,
  base_url: String,
}

impl HttpOracle {
  /// Construct the client if we find ORACLE_APP_ID; otherwise return None.
  pub fn from_env(timeout: Duration) -> Option<Self> {
    let app_id = std::env::var("ORACLE_APP_ID").ok()?;
    let base_url = std::env::var("ORACLE_BASE_URL")
      .unwrap_or_else(|_| "https://api.wolframalpha.com/v1/result".into());
    let client = reqwest::Client::builder().timeout(timeout).build().ok()?;
    Some(Self { client, app_id, base_url })
  }
}

#[async_trait]
impl SymbolicOracle for HttpOracle {
  #[instrument(level = "info", skip(self, query), fields(query_len = query.len()))]
  async fn query(&self, query: &str) -> Result<OracleAnswer, ServiceError> {
    let q = query.trim();
    if q.is_empty() {
      return Ok(OracleAnswer::Unparseable(String::new()));
    }
    let res = self.client
      .get(&self.base_url)
      .query(&[("i", q), ("appid", self.app_id.as_str())])
      .send()
      .await
      .map_err(|e| ServiceError::Transport { service: SERVICE, message: e.to_string() })?;

    let status = res.status();
    let body = res.text().await.unwrap_or_default().trim().to_string();
    info!(%status, result = %trunc_for_log(&body, 80), "Oracle answered");
    classify(status.as_u16(), body)
  }
}

fn classify(status: u16, body: String) -> Result<OracleAnswer, ServiceError> {
  match status {
    200 if body.to_lowercase().contains(NOT_UNDERSTOOD) || body.is_empty() => Ok(OracleAnswer::Unparseable(body)),
    200 => Ok(OracleAnswer::Result(body)),
    400 | 501 => Ok(OracleAnswer::Unparseable(body)),
    s => Err(ServiceError::Http { service: SERVICE, status: s, body }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_codes_map_to_answers() {
    assert_eq!(classify(200, "x = 4".into()).unwrap(), OracleAnswer::Result("x = 4".into()));
    assert!(matches!(classify(501, "Wolfram|Alpha did not understand your input".into()), Ok(OracleAnswer::Unparseable(_))));
    assert!(matches!(classify(200, "Wolfram|Alpha did not understand your input".into()), Ok(OracleAnswer::Unparseable(_))));
    assert!(matches!(classify(403, "bad appid".into()), Err(ServiceError::Http { status: 403, .. })));
  }
}
