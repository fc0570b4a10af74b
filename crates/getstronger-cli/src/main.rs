//! getstronger - terminal client for the getstronger API.
//!
//! Logs in, keeps the session fresh in the background and prints the live
//! unread notification count.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use getstronger_core::auth::{CookieStoreMutex, SessionStore};
use getstronger_core::ui::LOGOUT_PATH;
use getstronger_core::{AlertSink, Config, Navigator, SessionClient};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long `logout` waits for the server before giving up
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

const USAGE: &str = "Usage: getstronger <login [--email EMAIL] | watch | logout>";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

enum Command {
    Login { email: Option<String> },
    Watch,
    Logout,
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        Some("login") => {
            let email = match args.get(1).map(String::as_str) {
                Some("--email") => Some(
                    args.get(2)
                        .cloned()
                        .context("--email needs a value")?,
                ),
                Some(other) => bail!("unexpected argument '{}'\n{}", other, USAGE),
                None => None,
            };
            Ok(Command::Login { email })
        }
        Some("watch") => Ok(Command::Watch),
        Some("logout") => Ok(Command::Logout),
        _ => bail!(USAGE),
    }
}

/// Ends `watch` when the session is torn down.
struct CliNavigator {
    logged_out: Arc<Notify>,
}

impl Navigator for CliNavigator {
    fn navigate_to(&self, path: &str) {
        info!(path, "navigate");
        if path == LOGOUT_PATH {
            self.logged_out.notify_one();
        }
    }
}

struct CliAlerts;

impl AlertSink for CliAlerts {
    fn alert(&self, message: &str) {
        eprintln!("{}", message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let mut config = Config::load()?;
    let store = SessionStore::new(config.cache_dir()?);
    let cookies = Arc::new(CookieStoreMutex::new(
        store.load_cookies().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load saved cookies");
            Default::default()
        }),
    ));
    let logged_out = Arc::new(Notify::new());
    let client = SessionClient::new(
        &config,
        Arc::clone(&cookies),
        Arc::new(CliNavigator {
            logged_out: Arc::clone(&logged_out),
        }),
        Arc::new(CliAlerts),
    )?;

    let session = Saved {
        store: &store,
        cookies: &cookies,
    };
    match command {
        Command::Login { email } => {
            login_interactive(&client, &mut config, &session, email).await?;
            client.shutdown().await;
            Ok(())
        }
        Command::Watch => watch(&client, &mut config, &session, &logged_out).await,
        Command::Logout => logout(&client, &store).await,
    }
}

/// On-disk session: the last credential plus the cookie jar holding the
/// refresh token.
struct Saved<'a> {
    store: &'a SessionStore,
    cookies: &'a CookieStoreMutex,
}

impl Saved<'_> {
    fn save(&self, client: &SessionClient) -> Result<()> {
        if let Some(credential) = client.credential() {
            self.store.save(&credential)?;
            self.store.save_cookies(self.cookies)?;
        }
        Ok(())
    }
}

async fn login_interactive(
    client: &SessionClient,
    config: &mut Config,
    session: &Saved<'_>,
    email: Option<String>,
) -> Result<()> {
    println!("\n=== getstronger Login ===\n");

    let email = match email {
        Some(email) => email,
        None => prompt_email(config.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    println!("\nAuthenticating...");
    client.login(&email, &password).await?;

    session.save(client)?;
    config.last_email = Some(email);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Login successful!\n");
    Ok(())
}

fn prompt_email(last_email: Option<&str>) -> Result<String> {
    match last_email {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last_email) {
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => bail!("Email required"),
        (false, _) => Ok(input.to_string()),
    }
}

async fn watch(
    client: &SessionClient,
    config: &mut Config,
    session: &Saved<'_>,
    logged_out: &Notify,
) -> Result<()> {
    match session.store.load() {
        Ok(Some(credential)) => client.resume(credential),
        Ok(None) => login_interactive(client, config, session, None).await?,
        Err(e) => {
            warn!(error = %e, "Failed to load saved session");
            login_interactive(client, config, session, None).await?;
        }
    }

    let mut counts = client.unread().subscribe();
    println!("Unread notifications: {}", *counts.borrow_and_update());

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            _ = logged_out.notified() => {
                if let Err(e) = session.store.clear() {
                    warn!(error = %e, "Failed to clear saved session");
                }
                break Err(anyhow::anyhow!(
                    "Session expired. Run `getstronger login` to sign in again."
                ));
            }
            changed = counts.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                println!("Unread notifications: {}", *counts.borrow_and_update());
            }
        }
    };

    // Keep the most recently refreshed token for the next run.
    if let Err(e) = session.save(client) {
        warn!(error = %e, "Failed to save session");
    }
    client.shutdown().await;
    result
}

/// The server logout runs first so it still carries the refresh cookie.
async fn logout(client: &SessionClient, store: &SessionStore) -> Result<()> {
    let remote = client.logout().await;
    if tokio::time::timeout(LOGOUT_TIMEOUT, remote).await.is_err() {
        warn!("Timed out waiting for server logout");
    }
    store.clear()?;

    println!("Logged out.");
    Ok(())
}
