pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
pub(crate) mod test_support;

use application::bootstrap::COMMAND_LOG_FILE;
use application::commands::{
    add_entry_impl, clear_cloud_impl, delete_month_impl, fetch_activity_impl, fetch_ics_impl,
    list_months_impl, mark_day_impl, month_summary_impl, pull_settings_impl, push_settings_impl,
    set_cloud_impl, set_default_cloud_url_impl, set_profile_impl, show_cloud_impl,
    show_month_impl, show_settings_impl, AppState, NewEntry, ProfileUpdate,
};
use clap::{ArgAction, Parser, Subcommand};
use infrastructure::error::InfraError;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const APP_DIR_NAME: &str = "timesheet-sync";

#[derive(Debug, Parser)]
#[command(
    name = "timesheet-sync",
    version,
    about = "Monthly timesheets stored locally and mirrored to a timesheet server"
)]
pub struct Cli {
    /// Workspace holding config/, state/ and logs/.
    #[arg(long, env = "TIMESHEET_SYNC_HOME", global = true)]
    pub workspace: Option<PathBuf>,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a month, preferring a versioned cloud copy.
    Show { year: i32, month: u32 },
    /// Append an entry to a day and save the month.
    Add {
        year: i32,
        month: u32,
        day: u32,
        #[arg(long)]
        minutes: u32,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "project")]
        projects: Vec<String>,
    },
    /// Set the sick and holiday flags of a day.
    Mark {
        year: i32,
        month: u32,
        day: u32,
        #[arg(long)]
        sick: bool,
        #[arg(long)]
        holiday: bool,
    },
    /// Remove a month locally and on the server.
    Delete { year: i32, month: u32 },
    /// Months stored on this machine.
    List,
    /// Worked versus expected minutes for a month.
    Summary { year: i32, month: u32 },
    Cloud {
        #[command(subcommand)]
        action: CloudCommand,
    },
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
    /// Calendar entries for a day from the server's ICS feed.
    Ics { month: u32, day: u32 },
    /// GitLab events around a day (YYYY-MM-DD).
    Activity { date: String },
}

#[derive(Debug, Subcommand)]
pub enum CloudCommand {
    Set { url: String, key: String },
    Clear,
    Show,
    /// Fallback URL for cloud settings that only carry a key.
    SetDefault { url: Option<String> },
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,
    SetProfile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        ics_url: Option<String>,
        #[arg(long)]
        gitlab_url: Option<String>,
        #[arg(long)]
        gitlab_token: Option<String>,
        #[arg(long = "project")]
        projects: Option<Vec<String>>,
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
    },
    Push,
    Pull,
}

pub fn init_tracing(verbose: u8, logs_dir: &Path) -> Result<(), InfraError> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|error| InfraError::InvalidConfig(format!("invalid RUST_LOG filter: {error}")))?;
    let file_filter = EnvFilter::try_new(if verbose >= 2 { level } else { "info" })
        .map_err(|error| InfraError::InvalidConfig(format!("invalid log filter: {error}")))?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(COMMAND_LOG_FILE))?;

    let init_result = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(std::io::stderr().is_terminal())
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(log_file))
                .with_filter(file_filter),
        )
        .try_init();

    if let Err(error) = init_result {
        tracing::debug!(%error, "tracing subscriber already set, continuing");
    }
    Ok(())
}

fn resolve_workspace(explicit: Option<PathBuf>) -> Result<PathBuf, String> {
    explicit
        .or_else(|| dirs::data_dir().map(|dir| dir.join(APP_DIR_NAME)))
        .ok_or_else(|| "no data directory found; pass --workspace".to_string())
}

fn render<T: Serialize>(result: Result<T, InfraError>) -> Result<String, InfraError> {
    Ok(serde_json::to_string_pretty(&result?)?)
}

async fn execute(state: &AppState, command: Command) -> Result<String, String> {
    let (name, result) = match command {
        Command::Show { year, month } => ("show", render(show_month_impl(state, year, month).await)),
        Command::Add {
            year,
            month,
            day,
            minutes,
            description,
            tags,
            projects,
        } => {
            let entry = NewEntry {
                minutes,
                description,
                tags,
                projects,
            };
            ("add", render(add_entry_impl(state, year, month, day, entry).await))
        }
        Command::Mark {
            year,
            month,
            day,
            sick,
            holiday,
        } => ("mark", render(mark_day_impl(state, year, month, day, sick, holiday).await)),
        Command::Delete { year, month } => (
            "delete",
            render(
                delete_month_impl(state, year, month)
                    .await
                    .map(|removed| serde_json::json!({ "removed": removed })),
            ),
        ),
        Command::List => ("list", render(list_months_impl(state))),
        Command::Summary { year, month } => {
            ("summary", render(month_summary_impl(state, year, month).await))
        }
        Command::Cloud { action } => match action {
            CloudCommand::Set { url, key } => ("cloud_set", render(set_cloud_impl(state, url, key))),
            CloudCommand::Clear => ("cloud_clear", render(clear_cloud_impl(state))),
            CloudCommand::Show => ("cloud_show", render(show_cloud_impl(state))),
            CloudCommand::SetDefault { url } => (
                "cloud_set_default",
                render(
                    set_default_cloud_url_impl(state, url)
                        .map(|()| serde_json::json!({ "saved": true })),
                ),
            ),
        },
        Command::Settings { action } => match action {
            SettingsCommand::Show => ("settings_show", render(show_settings_impl(state))),
            SettingsCommand::SetProfile {
                name,
                company,
                client,
                ics_url,
                gitlab_url,
                gitlab_token,
                projects,
                tags,
            } => {
                let update = ProfileUpdate {
                    name,
                    company,
                    client,
                    ics_url,
                    gitlab_url,
                    gitlab_access_token: gitlab_token,
                    projects,
                    tags,
                };
                ("settings_set_profile", render(set_profile_impl(state, update)))
            }
            SettingsCommand::Push => ("settings_push", render(push_settings_impl(state).await)),
            SettingsCommand::Pull => ("settings_pull", render(pull_settings_impl(state).await)),
        },
        Command::Ics { month, day } => ("ics", render(fetch_ics_impl(state, month, day).await)),
        Command::Activity { date } => ("activity", render(fetch_activity_impl(state, date).await)),
    };

    result.map_err(|error| state.command_error(name, &error))
}

pub fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let workspace_root = resolve_workspace(cli.workspace)?;
    let logs_dir = workspace_root.join("logs");
    fs::create_dir_all(&logs_dir).map_err(|error| error.to_string())?;
    init_tracing(cli.verbose, &logs_dir).map_err(|error| error.to_string())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| error.to_string())?;

    runtime.block_on(async move {
        let state = AppState::new(workspace_root).map_err(|error| error.to_string())?;
        tracing::debug!(
            workspace = %state.workspace_root().display(),
            database = %state.database_path().display(),
            "workspace ready"
        );
        let listeners = state.watch_storage();

        let outcome = execute(&state, cli.command).await;
        for listener in listeners {
            listener.abort();
        }

        let output = outcome?;
        println!("{output}");
        Ok::<(), String>(())
    })
}
