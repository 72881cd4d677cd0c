use std::collections::HashSet;

use anyhow::{anyhow, Result};
use chrono::Duration;

use crate::{
    storage::{interval::DayKey, project_store::ProjectStore},
    utils::time::{format_balance, format_date, format_duration, format_timestamp},
};

/// Prints every project with the time spent on it.
pub async fn print_projects(store: &ProjectStore) -> Result<()> {
    let projects = store.list_projects().await?;
    if projects.is_empty() {
        println!("No projects recorded yet");
        return Ok(());
    }
    println!("The recorded projects:");
    for project in projects {
        let total = store.total_duration(&project, None).await?;
        println!("{project}");
        match store.pending_session(&project).await {
            Ok(Some(pending)) => println!(
                "\t{}\trunning since {}",
                format_duration(total),
                format_timestamp(pending.start())
            ),
            _ => println!("\t{}", format_duration(total)),
        }
    }
    Ok(())
}

/// Prints days with recorded work, most recent first, with the projects worked on.
pub async fn print_dates(store: &ProjectStore) -> Result<()> {
    for date in store.list_dates_with_activity().await? {
        let projects = store.projects_active_on(date).await?;
        println!("{}\t{}", format_date(date), projects.join(", "));
    }
    Ok(())
}

/// Prints intervals of a project grouped by day. Only days in `filter` are shown, if given.
/// With `planned` every day is also compared to the planned amount of work.
pub async fn print_summary(
    store: &ProjectStore,
    project: &str,
    filter: Option<&HashSet<DayKey>>,
    planned: Option<Duration>,
    json: bool,
) -> Result<()> {
    let log = store.load(project).await?;
    if log.is_out_of_order() {
        eprintln!("Warning: intervals of {project} are not in chronological order");
    }
    let summaries = log.daily_summaries(filter);

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    for day in &summaries {
        match planned {
            Some(planned) => println!(
                "{} {} ({})",
                format_date(day.day),
                format_duration(day.total),
                format_balance(day.total - planned)
            ),
            None => println!("{} {}", format_date(day.day), format_duration(day.total)),
        }
        for interval in &day.intervals {
            println!(
                "\t{} - {}\t{}",
                interval.start().format("%H:%M:%S"),
                interval.end().format("%H:%M:%S"),
                format_duration(interval.duration())
            );
        }
        println!();
    }
    let total = summaries
        .iter()
        .map(|v| v.total)
        .fold(Duration::zero(), |sum, v| sum + v);
    println!(
        "Total {} over {} days",
        format_duration(total),
        summaries.len()
    );
    if let Some(planned) = planned {
        let expected = i32::try_from(summaries.len())
            .ok()
            .and_then(|days| planned.checked_mul(days))
            .ok_or_else(|| anyhow!("Planned time over {} days is too large", summaries.len()))?;
        println!(
            "Balance {} with {} planned per day",
            format_balance(total - expected),
            format_duration(planned)
        );
    }
    Ok(())
}
