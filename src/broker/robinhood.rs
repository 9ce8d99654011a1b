use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{BrokerError, OptionChain, OptionInstrument, OptionMarketData, OptionsSource};
use crate::config::Credentials;

/// Public OAuth client id used by Robinhood's web app.
pub const CLIENT_ID: &str = "c82SH0WZOsabOXGP2sxqcj34FxkvfnWRZBKlBjFS";
const SESSION_SECS: u32 = 86_400;
const MAX_RETRIES: u32 = 3;
const CHALLENGE_HEADER: &str = "X-ROBINHOOD-CHALLENGE-RESPONSE-ID";

// ── OAuth payloads ──────────────────────────────────────────────────

/// Form body for `POST /oauth2/token/`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest {
    client_id: &'static str,
    expires_in: u32,
    grant_type: &'static str,
    scope: &'static str,
    device_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mfa_code: Option<String>,
}

impl TokenRequest {
    pub fn password(creds: &Credentials, device_token: &str) -> Self {
        TokenRequest {
            client_id: CLIENT_ID,
            expires_in: SESSION_SECS,
            grant_type: "password",
            scope: "internal",
            device_token: device_token.to_string(),
            username: Some(creds.username.clone()),
            password: Some(creds.password.clone()),
            challenge_type: Some("sms"),
            refresh_token: None,
            mfa_code: None,
        }
    }

    pub fn refresh(refresh_token: &str, device_token: &str) -> Self {
        TokenRequest {
            client_id: CLIENT_ID,
            expires_in: SESSION_SECS,
            grant_type: "refresh_token",
            scope: "internal",
            device_token: device_token.to_string(),
            username: None,
            password: None,
            challenge_type: None,
            refresh_token: Some(refresh_token.to_string()),
            mfa_code: None,
        }
    }

    pub fn with_mfa_code(mut self, code: &str) -> Self {
        self.mfa_code = Some(code.to_string());
        self
    }
}

/// Tokens granted by a successful login or refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
}

impl OAuthTokens {
    fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// What the token endpoint asked for next.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenReply {
    Granted(OAuthTokens),
    MfaRequired { mfa_type: Option<String> },
    Challenge { id: String, kind: String },
    VerificationWorkflow { id: String },
    Rejected(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawTokenReply {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    #[serde(default)]
    mfa_required: bool,
    mfa_type: Option<String>,
    challenge: Option<RawChallenge>,
    verification_workflow: Option<RawWorkflow>,
    detail: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChallenge {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    id: String,
}

impl RawTokenReply {
    fn into_reply(self, status: StatusCode) -> TokenReply {
        if let Some(access_token) = self.access_token {
            return TokenReply::Granted(OAuthTokens {
                token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
                access_token,
                refresh_token: self.refresh_token.unwrap_or_default(),
            });
        }
        if self.mfa_required {
            return TokenReply::MfaRequired {
                mfa_type: self.mfa_type,
            };
        }
        if let Some(c) = self.challenge {
            return TokenReply::Challenge {
                id: c.id,
                kind: c.kind,
            };
        }
        if let Some(w) = self.verification_workflow {
            return TokenReply::VerificationWorkflow { id: w.id };
        }
        TokenReply::Rejected(
            self.detail
                .or(self.error)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        )
    }
}

// ── Listing payloads ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Page<T> {
    next: Option<String>,
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct EquityInstrument {
    symbol: String,
    tradable_chain_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChainResponse {
    id: String,
    symbol: String,
    #[serde(default)]
    expiration_dates: Vec<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct MarketDataResponse {
    results: Vec<Option<OptionMarketData>>,
}

#[derive(Debug, Deserialize)]
struct Account {
    account_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeResult {
    status: String,
}

// ── Client ──────────────────────────────────────────────────────────

/// Thin typed client over the Robinhood REST API.
pub struct RobinhoodClient {
    http: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
    retry_base: Duration,
}

impl RobinhoodClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("optchain/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("creating HTTP client")?;
        Ok(RobinhoodClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: None,
            retry_base: Duration::from_secs(1),
        })
    }

    /// First backoff delay; doubles on every retry.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn set_tokens(&mut self, tokens: &OAuthTokens) {
        self.authorization = Some(tokens.authorization());
    }

    pub fn clear_tokens(&mut self) {
        self.authorization = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authorization.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    // ── Auth endpoints ──

    /// `POST /oauth2/token/`. Non-2xx replies still carry JSON describing
    /// the next login step, so only 5xx and unparseable bodies are errors.
    pub async fn request_token(
        &self,
        form: &TokenRequest,
        challenge_id: Option<&str>,
    ) -> Result<TokenReply, BrokerError> {
        let url = self.url("oauth2/token/");
        let mut req = self.http.post(&url).form(form);
        if let Some(id) = challenge_id {
            req = req.header(CHALLENGE_HEADER, id);
        }
        tracing::debug!(grant = form.grant_type, "requesting oauth token");

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_server_error() {
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let raw: RawTokenReply = serde_json::from_str(&body).map_err(|_| BrokerError::Status {
            status: status.as_u16(),
            body: body.clone(),
        })?;
        Ok(raw.into_reply(status))
    }

    /// Answer an SMS/email challenge issued during login.
    pub async fn respond_to_challenge(&self, id: &str, code: &str) -> Result<(), BrokerError> {
        let url = self.url(&format!("challenge/{id}/respond/"));
        let resp = self
            .http
            .post(&url)
            .form(&[("response", code)])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        let accepted = serde_json::from_str::<ChallengeResult>(&body)
            .map(|r| r.status == "validated")
            .unwrap_or(false);
        if status.is_success() && accepted {
            Ok(())
        } else {
            Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Cheap authenticated call; `false` when the session is rejected.
    pub async fn session_is_valid(&self) -> Result<bool, BrokerError> {
        if self.authorization.is_none() {
            return Ok(false);
        }
        let url = self.url("positions/");
        match self
            .get_json::<serde_json::Value>(&url, &[("nonzero", "true")])
            .await
        {
            Ok(_) => Ok(true),
            Err(BrokerError::Unauthorized(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Account number of the first brokerage account, if any.
    pub async fn account_number(&self) -> Result<Option<String>, BrokerError> {
        let url = self.url("accounts/");
        let page: Page<Account> = self.get_json(&url, &[]).await?;
        Ok(page.results.into_iter().find_map(|a| a.account_number))
    }

    // ── Transport ──

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BrokerError> {
        retry(MAX_RETRIES, self.retry_base, || self.get_once(url, query)).await
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BrokerError> {
        tracing::debug!(%url, ?query, "GET");
        let mut req = self.http.get(url).query(query);
        if let Some(auth) = &self.authorization {
            req = req.header(reqwest::header::AUTHORIZATION, auth);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BrokerError::Unauthorized(status.as_u16()));
        }
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| BrokerError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// Follow `next` links until the listing is exhausted.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, BrokerError> {
        let mut page: Page<T> = self.get_json(url, query).await?;
        let mut all = std::mem::take(&mut page.results);
        while let Some(next) = page.next.take() {
            page = self.get_json(&next, &[]).await?;
            all.append(&mut page.results);
        }
        Ok(all)
    }
}

/// Retry an operation with exponential backoff while its error is transient.
async fn retry<T, F, Fut>(max_retries: u32, base: Duration, f: F) -> Result<T, BrokerError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = base * 2u32.pow(attempt);
                tracing::warn!(attempt = attempt + 1, ?delay, "transient error: {e}; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl OptionsSource for RobinhoodClient {
    async fn chain(&self, symbol: &str) -> Result<OptionChain> {
        let url = self.url("instruments/");
        let page: Page<EquityInstrument> = self.get_json(&url, &[("symbol", symbol)]).await?;
        let Some(instrument) = page
            .results
            .into_iter()
            .find(|i| i.symbol.eq_ignore_ascii_case(symbol))
        else {
            return Err(BrokerError::NotFound(symbol.to_string()).into());
        };
        let Some(chain_id) = instrument.tradable_chain_id else {
            bail!("{symbol} has no listed options");
        };

        let url = self.url(&format!("options/chains/{chain_id}/"));
        let chain: ChainResponse = self
            .get_json(&url, &[])
            .await
            .with_context(|| format!("loading option chain for {symbol}"))?;

        let mut expiration_dates = chain.expiration_dates;
        expiration_dates.sort();
        expiration_dates.dedup();

        Ok(OptionChain {
            id: chain.id,
            symbol: chain.symbol,
            expiration_dates,
        })
    }

    async fn option_instruments(
        &self,
        chain: &OptionChain,
        expiration: NaiveDate,
    ) -> Result<Vec<OptionInstrument>> {
        let url = self.url("options/instruments/");
        let date = expiration.format("%Y-%m-%d").to_string();
        let instruments = self
            .get_paginated(
                &url,
                &[
                    ("chain_id", chain.id.as_str()),
                    ("expiration_dates", date.as_str()),
                    ("state", "active"),
                ],
            )
            .await
            .with_context(|| format!("listing {} contracts expiring {date}", chain.symbol))?;
        Ok(instruments)
    }

    async fn market_data(&self, ids: &[String]) -> Result<Vec<OptionMarketData>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url("marketdata/options/");
        let joined = ids.join(",");
        let resp: MarketDataResponse = self
            .get_json(&url, &[("ids", joined.as_str())])
            .await
            .with_context(|| format!("loading market data for {} contracts", ids.len()))?;
        Ok(resp.results.into_iter().flatten().collect())
    }
}
