use crate::cache::LeaderboardCache;
use crate::engine::ScoringEngine;
use anyhow::{Context, Result};
use common::types::{EventType, LeaderboardCategory, ResolutionData};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Sweep,
    Resolve {
        forecast_id: i64,
        outcome: String,
        data: ResolutionData,
    },
    Leaderboard {
        category: LeaderboardCategory,
        page: u32,
        page_size: u32,
    },
    Accuracy {
        user_id: i64,
        event_type: Option<EventType>,
    },
    Stats,
}

const USAGE_RESOLVE: &str = "usage: scoring resolve <forecast_id> <outcome> [resolution_json]";
const USAGE_ACCURACY: &str = "usage: scoring accuracy <user_id> [event_type]";

fn parse_num<T: std::str::FromStr>(raw: Option<String>, what: &str, usage: &str) -> Result<T, String> {
    let raw = raw.ok_or_else(|| usage.to_string())?;
    raw.parse()
        .map_err(|_| format!("invalid {what}: {raw}\n{usage}"))
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "sweep" => Ok(Command::Sweep),
        "resolve" => {
            let forecast_id = parse_num(args.next(), "forecast id", USAGE_RESOLVE)?;
            let outcome = args.next().ok_or_else(|| USAGE_RESOLVE.to_string())?;
            let data = match args.next() {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| format!("invalid resolution json: {e}\n{USAGE_RESOLVE}"))?,
                None => ResolutionData::default(),
            };
            Ok(Command::Resolve {
                forecast_id,
                outcome,
                data,
            })
        }
        "leaderboard" => {
            let category = match args.next() {
                Some(raw) => LeaderboardCategory::parse(&raw)
                    .ok_or_else(|| format!("unknown leaderboard category: {raw}"))?,
                None => LeaderboardCategory::Overall,
            };
            let usage = "usage: scoring leaderboard [category] [page] [page_size]";
            let page = args
                .next()
                .map_or(Ok(1), |raw| parse_num(Some(raw), "page", usage))?;
            // 0 selects the configured default page size.
            let page_size = args
                .next()
                .map_or(Ok(0), |raw| parse_num(Some(raw), "page size", usage))?;
            Ok(Command::Leaderboard {
                category,
                page,
                page_size,
            })
        }
        "accuracy" => {
            let user_id = parse_num(args.next(), "user id", USAGE_ACCURACY)?;
            let event_type = match args.next() {
                Some(raw) => Some(
                    EventType::parse(&raw).ok_or_else(|| format!("unknown event type: {raw}"))?,
                ),
                None => None,
            };
            Ok(Command::Accuracy {
                user_id,
                event_type,
            })
        }
        "stats" => Ok(Command::Stats),
        other => Err(format!("unknown command: {other}")),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute a one-shot command. `Run` is handled by the caller.
pub async fn run_command<C: LeaderboardCache>(engine: &ScoringEngine<C>, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::Sweep => print_json(&engine.run_expiry_sweep().await),
        Command::Resolve {
            forecast_id,
            outcome,
            data,
        } => {
            let result = engine
                .resolve_forecast(forecast_id, &outcome, &data)
                .await
                .with_context(|| format!("resolving forecast {forecast_id}"))?;
            print_json(&result)
        }
        Command::Leaderboard {
            category,
            page,
            page_size,
        } => print_json(&engine.get_leaderboard_page(category, page, page_size, None).await?),
        Command::Accuracy {
            user_id,
            event_type,
        } => print_json(&engine.get_user_accuracy(user_id, event_type).await?),
        Command::Stats => print_json(&engine.get_leaderboard_stats().await?),
    }
}
