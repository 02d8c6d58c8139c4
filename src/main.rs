use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;

use bearer_session::auth::{SessionManager, SqliteTokenStore};
use bearer_session::config::{Command, Config};
use bearer_session::http_client::{ApiRequest, ApiResponse};
use bearer_session::navigation::LogNavigator;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("API: {}", config.base_url);
    tracing::debug!("Token store: {}", config.token_db_file.display());

    let store = Arc::new(
        SqliteTokenStore::open(&config.token_db_file).context("Failed to open token store")?,
    );
    let manager = SessionManager::new(&config, store, Arc::new(LogNavigator))?;

    // Every command starts from the persisted session
    let session = manager.bootstrap().await;

    match command {
        Command::Login { email, password } => {
            let email = match email {
                Some(email) => email,
                None => Input::new()
                    .with_prompt("Email")
                    .interact_text()
                    .context("Failed to read email")?,
            };
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            let user = manager.sign_in(&email, &password).await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }

        Command::Logout => {
            manager.sign_out().await;
            println!("Signed out");
        }

        Command::Whoami => match session.user() {
            Some(user) => println!("{}", serde_json::to_string_pretty(user)?),
            None => anyhow::bail!("Not signed in (use `bearer-session login`)"),
        },

        Command::Get { path } => {
            let response = manager.client().send(ApiRequest::get(path)).await?;
            print_body(&response);
        }

        Command::Post { path, body } => {
            let body: serde_json::Value = serde_json::from_str(body.as_deref().unwrap_or("{}"))
                .context("Request body must be valid JSON")?;
            let response = manager
                .client()
                .send(ApiRequest::post(path, body))
                .await?;
            print_body(&response);
        }
    }

    Ok(())
}

/// Print a response body, pretty-printing JSON
fn print_body(response: &ApiResponse) {
    match response.json::<serde_json::Value>() {
        Ok(json) => println!(
            "{}",
            serde_json::to_string_pretty(&json).unwrap_or_else(|_| response.text())
        ),
        Err(_) => println!("{}", response.text()),
    }
}
