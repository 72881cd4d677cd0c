pub mod dates;
pub mod output;

use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand, ValueEnum};
use dates::{parse_day, parse_moment, DateStyle};
use output::{print_dates, print_projects, print_summary};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

use crate::{
    error::Error,
    session::{shutdown::detect_shutdown, SessionOutcome, SessionRunner},
    storage::{
        interval::DayKey,
        project_store::{ProjectStore, RecoveryAction},
    },
    utils::{
        clock::DefaultClock,
        dir::{create_application_default_path, ensure_dir},
        logging::{enable_logging, CLI_PREFIX},
        runtime::single_thread_runtime,
        time::{format_duration, format_timestamp},
    },
};

#[derive(Parser, Debug)]
#[command(name = "Punchclock", version, long_about = None)]
#[command(about = "Track time spent on projects", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, global = true, help = "Print logs to the console")]
    log: bool,
    #[arg(long = "log-filter", global = true, help = "Log level, defaults to $RUST_LOG or info")]
    log_filter: Option<LevelFilter>,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Start working on a project. The session lasts until Ctrl-C or `end`")]
    Start {
        project: String,
        #[arg(long, help = "Create the project if it doesn't exist yet")]
        new: bool,
        #[arg(
            long,
            default_value_t = 300,
            help = "Seconds between saving progress of the session"
        )]
        heartbeat: u64,
    },
    #[command(about = "End the running session of a project")]
    End { project: String },
    #[command(about = "Show the open session of a project")]
    Pending { project: String },
    #[command(about = "Resolve a session left open by a process that didn't close it")]
    Recover {
        project: String,
        #[arg(value_enum)]
        action: RecoverChoice,
        #[arg(
            long,
            required_if_eq("action", "edit"),
            help = "End of the session for `edit`. Examples are \"17:30\", \"yesterday 18:00\", \"1 hour ago\""
        )]
        end: Option<String>,
        #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
        date_style: DateStyle,
    },
    #[command(about = "List projects with the total time spent on them")]
    List {},
    #[command(about = "List days with recorded work")]
    Dates {},
    #[command(about = "Show recorded work of a project grouped by day")]
    Summary {
        project: String,
        #[arg(
            long = "date",
            short,
            help = "Only show these days. Examples are \"today\", \"yesterday\", \"15/03/2025\""
        )]
        dates: Vec<String>,
        #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
        date_style: DateStyle,
        #[arg(
            long,
            value_parser = parse_planned,
            help = "Hours planned per day, shows the balance against them"
        )]
        planned: Option<TimeDelta>,
        #[arg(long, help = "Print as json")]
        json: bool,
    },
    #[command(about = "Delete a project and all its recorded work")]
    Delete { project: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RecoverChoice {
    /// Record the session up to its last saved progress.
    Apply,
    /// Record the session up to `--end`.
    Edit,
    /// Drop the session.
    Discard,
}

/// Parses planned hours per day, which have to fit into a day.
fn parse_planned(text: &str) -> std::result::Result<TimeDelta, String> {
    let hours: f64 = text
        .parse()
        .map_err(|e| format!("{text:?} isn't a number of hours: {e}"))?;
    if !(0.0..=24.0).contains(&hours) {
        return Err(format!("planned hours must be between 0 and 24, got {hours}"));
    }
    TimeDelta::try_seconds((hours * 3600.).round() as i64)
        .ok_or_else(|| format!("{hours} hours is out of range"))
}

pub fn run_cli() -> Result<()> {
    let args = Args::parse();

    let app_dir = match args.dir {
        Some(dir) => ensure_dir(dir)?,
        None => create_application_default_path()?,
    };
    let log_level = args.log_filter.or(args.log.then_some(LevelFilter::TRACE));
    enable_logging(CLI_PREFIX, &app_dir, log_level, args.log)?;

    let store = Arc::new(ProjectStore::new(
        app_dir.join("projects"),
        Arc::new(DefaultClock),
    )?);

    single_thread_runtime()?.block_on(process_command(args.commands, store))
}

async fn process_command(command: Commands, store: Arc<ProjectStore>) -> Result<()> {
    match command {
        Commands::Start {
            project,
            new,
            heartbeat,
        } => start_project(store, project, new, Duration::from_secs(heartbeat)).await,
        Commands::End { project } => {
            let interval = store.end(&project).await?;
            println!(
                "Project {project} ended, recorded {interval} ({})",
                format_duration(interval.duration())
            );
            Ok(())
        }
        Commands::Pending { project } => {
            match store.pending_session(&project).await? {
                Some(pending) => println!(
                    "{project} has been running since {}, last saved at {}",
                    format_timestamp(pending.start()),
                    format_timestamp(pending.provisional_end())
                ),
                None => println!("{project} has no open session"),
            }
            Ok(())
        }
        Commands::Recover {
            project,
            action,
            end,
            date_style,
        } => {
            let action = match (action, end) {
                (RecoverChoice::Apply, _) => RecoveryAction::Apply,
                (RecoverChoice::Discard, _) => RecoveryAction::Discard,
                (RecoverChoice::Edit, Some(end)) => {
                    RecoveryAction::Edit(parse_moment(&end, date_style)?)
                }
                (RecoverChoice::Edit, None) => bail!("--end is required to edit a session"),
            };
            match store.recover(&project, action).await? {
                Some(interval) => println!("Recorded {interval} for {project}"),
                None => println!("Discarded the open session of {project}"),
            }
            Ok(())
        }
        Commands::List {} => print_projects(&store).await,
        Commands::Dates {} => print_dates(&store).await,
        Commands::Summary {
            project,
            dates,
            date_style,
            planned,
            json,
        } => {
            if !store.project_exists(&project).await? {
                return Err(Error::ProjectNotFound { project }.into());
            }
            let filter = if dates.is_empty() {
                None
            } else {
                Some(
                    dates
                        .iter()
                        .map(|v| parse_day(v, date_style).map(DayKey::from))
                        .collect::<Result<HashSet<_>>>()?,
                )
            };
            print_summary(&store, &project, filter.as_ref(), planned, json).await
        }
        Commands::Delete { project } => {
            store.delete(&project).await?;
            println!("Deleted {project}");
            Ok(())
        }
    }
}

/// Runs a session in the foreground until the process is asked to stop.
async fn start_project(
    store: Arc<ProjectStore>,
    project: String,
    new: bool,
    heartbeat: Duration,
) -> Result<()> {
    if !new && !store.project_exists(&project).await? {
        bail!("Project {project} not found, pass --new to create it");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(detect_shutdown(shutdown.clone()));

    let runner = SessionRunner::new(store.clone(), project.clone(), shutdown)
        .with_heartbeat_period(heartbeat)
        .on_terminate({
            let project = project.clone();
            move |interval| println!("\nProject {project} ends at {}", format_timestamp(interval.end()))
        });

    println!("Working on {project}, press Ctrl-C to stop");
    match runner.run().await {
        Ok(SessionOutcome::Closed(interval)) => {
            println!("Recorded {}", format_duration(interval.duration()));
            Ok(())
        }
        Ok(SessionOutcome::Discarded(_)) => {
            println!("Session was too short to be recorded");
            Ok(())
        }
        Ok(SessionOutcome::Unresolved(pending)) => {
            eprintln!(
                "Clock is behind the session started at {}, it was kept open with progress until {}.",
                format_timestamp(pending.start()),
                format_timestamp(pending.provisional_end())
            );
            eprintln!("Resolve it with `punchclock recover {project} apply|edit|discard`");
            bail!("Session of {project} wasn't recorded")
        }
        Ok(SessionOutcome::EndedElsewhere) => {
            println!("Session of {project} was ended elsewhere");
            Ok(())
        }
        Err(Error::SessionAlreadyRunning { pending, .. }) => {
            match pending {
                Some(pending) => eprintln!(
                    "{project} already has a session started at {}, last saved at {}.",
                    format_timestamp(pending.start()),
                    format_timestamp(pending.provisional_end())
                ),
                None => eprintln!("{project} already has a session that can't be read."),
            }
            eprintln!(
                "If it isn't running anymore, resolve it with `punchclock recover {project} apply|edit|discard`"
            );
            bail!("Another session of {project} is running")
        }
        Err(e) => Err(e.into()),
    }
}
