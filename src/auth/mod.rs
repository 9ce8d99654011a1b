pub mod token;

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::broker::BrokerError;
use crate::broker::robinhood::{RobinhoodClient, TokenReply, TokenRequest};
use crate::config::{self, Credentials};

use token::{TokenFile, TokenStore};

const MAX_CODE_PROMPTS: u32 = 3;

// ── Code prompt ─────────────────────────────────────────────────────

/// Source of one-time codes during login.
pub trait CodePrompt {
    fn read_code(&self, message: &str) -> Result<String>;
}

/// Reads codes from the terminal.
pub struct StdinPrompt;

impl CodePrompt for StdinPrompt {
    fn read_code(&self, message: &str) -> Result<String> {
        print!("{message}: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("reading code from stdin")?;
        let code = line.trim().to_string();
        if code.is_empty() {
            bail!("no code entered");
        }
        Ok(code)
    }
}

/// Refuses to prompt.
pub struct NoPrompt;

impl CodePrompt for NoPrompt {
    fn read_code(&self, _message: &str) -> Result<String> {
        bail!("a verification code is required; run `optchain setup-auth` interactively")
    }
}

// ── Login ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Reuse the stored session when it still works.
    Cached,
    /// Always do a full password login.
    Fresh,
}

/// How the client ended up authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Cached,
    Refreshed,
    LoggedIn,
}

/// Authenticate `client`, persisting whatever session results.
pub async fn authenticate(
    client: &mut RobinhoodClient,
    store: &TokenStore,
    credentials: Option<&Credentials>,
    prompt: &dyn CodePrompt,
    mode: AuthMode,
) -> Result<AuthOutcome> {
    let file = store.load_or_new()?;

    if mode == AuthMode::Cached {
        if let Some(session) = &file.session {
            client.set_tokens(&session.tokens);
            if client
                .session_is_valid()
                .await
                .context("checking cached session")?
            {
                tracing::info!("reusing cached session from {}", store.path().display());
                return Ok(AuthOutcome::Cached);
            }
            client.clear_tokens();

            if !session.tokens.refresh_token.is_empty() {
                let form = TokenRequest::refresh(&session.tokens.refresh_token, &file.device_token);
                match client.request_token(&form, None).await {
                    Ok(TokenReply::Granted(tokens)) => {
                        client.set_tokens(&tokens);
                        store.save(&file.clone().with_session(tokens))?;
                        tracing::info!("refreshed expired session");
                        return Ok(AuthOutcome::Refreshed);
                    }
                    Ok(other) => {
                        tracing::warn!(?other, "session refresh refused");
                        store.forget_session()?;
                    }
                    Err(e) => tracing::warn!("session refresh failed: {e}"),
                }
            }
        }
    }

    let Some(creds) = credentials else {
        bail!(
            "no valid cached session in {} and no credentials configured; \
             set {} and {} then run `optchain setup-auth`",
            store.path().display(),
            config::USERNAME_VAR,
            config::PASSWORD_VAR
        );
    };

    password_login(client, store, file, creds, prompt).await?;
    Ok(AuthOutcome::LoggedIn)
}

async fn password_login(
    client: &mut RobinhoodClient,
    store: &TokenStore,
    file: TokenFile,
    creds: &Credentials,
    prompt: &dyn CodePrompt,
) -> Result<()> {
    let mut form = TokenRequest::password(creds, &file.device_token);
    let mut challenge_id: Option<String> = None;
    let mut prompts = 0;

    loop {
        let reply = client
            .request_token(&form, challenge_id.as_deref())
            .await
            .context("requesting login token")?;

        match reply {
            TokenReply::Granted(tokens) => {
                client.set_tokens(&tokens);
                store.save(&file.with_session(tokens))?;
                return Ok(());
            }
            TokenReply::MfaRequired { mfa_type } => {
                prompts += 1;
                if prompts > MAX_CODE_PROMPTS {
                    bail!("too many MFA attempts");
                }
                let via = mfa_type.unwrap_or_else(|| "authenticator".to_string());
                let code = prompt.read_code(&format!("Enter MFA code ({via})"))?;
                form = form.with_mfa_code(&code);
            }
            TokenReply::Challenge { id, kind } => {
                prompts += 1;
                if prompts > MAX_CODE_PROMPTS {
                    bail!("too many verification attempts");
                }
                let code = prompt.read_code(&format!("Enter the {kind} verification code"))?;
                match client.respond_to_challenge(&id, &code).await {
                    Ok(()) => challenge_id = Some(id),
                    Err(BrokerError::Status { body, .. }) => {
                        tracing::warn!("challenge response rejected: {body}");
                        challenge_id = None;
                    }
                    Err(e) => return Err(e).context("answering login challenge"),
                }
            }
            TokenReply::VerificationWorkflow { id } => {
                bail!(
                    "Robinhood requires device approval (workflow {id}); \
                     approve the login in the Robinhood app, then run setup-auth again"
                );
            }
            TokenReply::Rejected(detail) => bail!("login rejected: {detail}"),
        }
    }
}

// ── setup-auth command ──────────────────────────────────────────────

/// Interactive one-time login that stores the device token for later runs.
pub fn run(token_file: Option<PathBuf>) -> Result<()> {
    let creds = Credentials::from_env()?;
    let store = TokenStore::new(config::resolve_token_path(token_file));

    println!("Robinhood authentication setup");
    println!("{}", "=".repeat(40));
    println!("Username: {}", creds.username);
    println!("Password: [loaded from environment]");
    println!();

    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(async {
        let mut client = RobinhoodClient::new(&config::api_base_url())?;
        println!("Logging in (you may be asked for an SMS or app code)...");
        authenticate(&mut client, &store, Some(&creds), &StdinPrompt, AuthMode::Fresh).await?;

        println!("Authenticated. Device token saved to {}", store.path().display());

        println!("Testing connection...");
        match client.account_number().await {
            Ok(Some(number)) => println!("Connection OK. Account: {number}"),
            Ok(None) => println!("Connection OK, but no brokerage account was listed"),
            Err(e) => println!("Connection test failed: {e}"),
        }
        Ok::<(), anyhow::Error>(())
    })?;

    println!();
    println!("Next: optchain download SYMBOL");
    Ok(())
}
