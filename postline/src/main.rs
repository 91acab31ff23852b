use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use postline::annotate::{AnnotationSession, FileAnnotator, ReviewState};
use postline::config::Config;
use postline::core::{FlaggedItem, ResolutionAction, ScheduleItem, Suggestion, TaskRecord};
use postline::import::Normalizer;
use postline::schedule::{Applied, SuggestionBoard, detect_conflicts};
use postline::selection::SelectionSet;
use postline::triage::{Resolution, TriageQueue};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "POSTLINE_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "postline",
    about = "Import, annotate and review scheduled social posts",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// TOML configuration file layered over the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize a CSV export or JSON task list and print the records.
    Import(ImportArgs),

    /// Pull media links, caption and hashtags out of a notes blob.
    Extract(ExtractArgs),

    /// List posts that share a date and time slot.
    Conflicts(ConflictsArgs),

    /// Apply suggestions to a post list.
    Apply(ApplyArgs),

    /// Resolve flagged items and print what is still pending.
    Triage(TriageArgs),

    /// Import a file, annotate it from a recorded response and summarize the review.
    Annotate(AnnotateArgs),
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Export file (.csv or .json).
    input: PathBuf,
    /// Emit JSON instead of one line per record.
    #[arg(long)]
    json: bool,
    /// Date used for blank date cells (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    /// Notes text given inline.
    #[arg(long, conflicts_with = "input")]
    text: Option<String>,
    /// File holding the notes text.
    #[arg(required_unless_present = "text")]
    input: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ConflictsArgs {
    /// JSON array of schedule items.
    posts: PathBuf,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ApplyArgs {
    /// JSON array of schedule items.
    posts: PathBuf,
    /// JSON array of suggestions.
    #[arg(long)]
    suggestions: PathBuf,
    /// Suggestion ids to apply (repeatable).
    #[arg(long = "select", conflicts_with = "all")]
    select: Vec<String>,
    /// Apply every suggestion.
    #[arg(long)]
    all: bool,
    /// Write the updated posts here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TriageArgs {
    /// JSON array of flagged items.
    flags: PathBuf,
    /// Resolve one item, as `<id>=<accept|edit|skip>` (repeatable).
    #[arg(long = "resolve", value_parser = parse_resolution)]
    resolve: Vec<(String, ResolutionAction)>,
    /// Accept the proposed fix for every remaining item.
    #[arg(long, conflicts_with = "dismiss_all")]
    fix_all: bool,
    /// Skip every remaining item.
    #[arg(long)]
    dismiss_all: bool,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct AnnotateArgs {
    /// Export file (.csv or .json).
    input: PathBuf,
    /// Recorded annotation service response.
    #[arg(long)]
    response: PathBuf,
    /// Date used for blank date cells (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Emit JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    debug!(?config, "configuration loaded");
    match cli.command {
        Commands::Import(args) => handle_import(args, &config),
        Commands::Extract(args) => handle_extract(args),
        Commands::Conflicts(args) => handle_conflicts(args),
        Commands::Apply(args) => handle_apply(args),
        Commands::Triage(args) => handle_triage(args, &config),
        Commands::Annotate(args) => handle_annotate(args, &config),
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

fn normalizer(config: &Config, today: Option<NaiveDate>) -> Normalizer {
    match today {
        Some(day) => Normalizer::with_today(config.import.clone(), day),
        None => Normalizer::new(config.import.clone()),
    }
}

fn handle_import(args: ImportArgs, config: &Config) -> Result<()> {
    let ImportArgs { input, json, today } = args;
    let records = normalizer(config, today)
        .read_file(&input)
        .with_context(|| format!("importing {:?}", input))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for record in &records {
            println!("{}", record_line(record));
        }
    }
    eprintln!("Imported {} record(s) from {}", records.len(), input.display());
    Ok(())
}

fn record_line(record: &TaskRecord) -> String {
    let tags = if record.tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", record.tags.join(", "))
    };
    format!(
        "{:<10} {:<10} {:<12} {:<10} {}{}",
        record.task_id, record.due_date, record.post_type, record.status, record.name, tags
    )
}

fn handle_extract(args: ExtractArgs) -> Result<()> {
    let notes = match (args.text, args.input) {
        (Some(text), _) => text,
        (None, Some(path)) => {
            fs::read_to_string(&path).with_context(|| format!("reading notes {:?}", path))?
        }
        (None, None) => anyhow::bail!("pass --text or a notes file"),
    };
    let extracted = postline::extract_notes(&notes);
    println!("{}", serde_json::to_string_pretty(&extracted)?);
    Ok(())
}

fn handle_conflicts(args: ConflictsArgs) -> Result<()> {
    let ConflictsArgs { posts, json } = args;
    let items: Vec<ScheduleItem> = read_json(&posts)?;
    let conflicts = detect_conflicts(&items);

    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }
    if conflicts.is_empty() {
        eprintln!("No scheduling conflicts found.");
        return Ok(());
    }
    for group in conflicts {
        let ids: Vec<String> = group.item_ids.iter().map(ToString::to_string).collect();
        println!("{} {}  {}", group.date, group.time, ids.join(", "));
    }
    Ok(())
}

fn handle_apply(args: ApplyArgs) -> Result<()> {
    let ApplyArgs {
        posts,
        suggestions,
        select,
        all,
        output,
    } = args;
    let items: Vec<ScheduleItem> = read_json(&posts)?;
    let suggestions: Vec<Suggestion> = read_json(&suggestions)?;

    let applied = apply_requested(&items, suggestions, &select, all)?;
    eprintln!(
        "Applied {} suggestion(s): {} change(s), {} missed target(s)",
        applied.applied_ids.len(),
        applied.report.applied,
        applied.report.missed.len()
    );

    let rendered = serde_json::to_string_pretty(&applied.items)?;
    match output {
        Some(path) => {
            fs::write(&path, rendered + "\n").with_context(|| format!("writing {:?}", path))?
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn apply_requested(
    items: &[ScheduleItem],
    suggestions: Vec<Suggestion>,
    select: &[String],
    all: bool,
) -> Result<Applied> {
    let board = SuggestionBoard::new(suggestions);
    if all {
        return Ok(board.apply_all(items));
    }
    if select.is_empty() {
        anyhow::bail!("nothing to apply: pass --select <id> or --all");
    }
    if let Some(unknown) = select.iter().find(|id| !board.is_active(id)) {
        anyhow::bail!("unknown suggestion id {unknown:?}");
    }
    let selection = select
        .iter()
        .fold(SelectionSet::new(), |set, id| {
            if set.is_selected(id, board.active()) {
                set
            } else {
                set.toggled(id, board.active())
            }
        });
    Ok(board.apply_selected(items, &selection))
}

#[derive(Debug, Serialize)]
struct TriageOutcome<'a> {
    resolutions: Vec<Resolution>,
    counts: postline::triage::SeverityCounts,
    pending: &'a [FlaggedItem],
}

fn handle_triage(args: TriageArgs, config: &Config) -> Result<()> {
    let TriageArgs {
        flags,
        resolve,
        fix_all,
        dismiss_all,
        json,
    } = args;
    let flagged: Vec<FlaggedItem> = read_json(&flags)?;
    let (queue, resolutions) = run_triage(
        TriageQueue::new(flagged),
        &resolve,
        bulk_action(fix_all, dismiss_all),
        config,
    )?;

    if json {
        let outcome = TriageOutcome {
            resolutions,
            counts: queue.counts(),
            pending: queue.pending(),
        };
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    for resolution in &resolutions {
        println!("resolved {} ({})", resolution.item_id, resolution.action);
    }
    let counts = queue.counts();
    println!(
        "{} pending: {} critical, {} warning",
        queue.len(),
        counts.critical,
        counts.warning
    );
    for item in queue.iter() {
        println!(
            "  [{:?}] {} {} ({}): {}",
            item.issue.severity, item.id, item.task_title, item.platform, item.issue.description
        );
    }
    Ok(())
}

fn bulk_action(fix_all: bool, dismiss_all: bool) -> Option<ResolutionAction> {
    if fix_all {
        Some(ResolutionAction::Accept)
    } else if dismiss_all {
        Some(ResolutionAction::Skip)
    } else {
        None
    }
}

fn run_triage(
    queue: TriageQueue,
    resolve: &[(String, ResolutionAction)],
    bulk: Option<ResolutionAction>,
    config: &Config,
) -> Result<(TriageQueue, Vec<Resolution>)> {
    let mut queue = queue;
    let mut resolutions = Vec::new();
    for (id, action) in resolve {
        let (next, resolution) = queue
            .resolve(id, *action)
            .with_context(|| format!("resolving {id:?}"))?;
        queue = next;
        resolutions.push(resolution);
    }
    if let Some(action) = bulk {
        let (next, bulk) = queue.resolve_all(action, config.triage.bulk_policy());
        queue = next;
        resolutions.extend(bulk);
    }
    Ok((queue, resolutions))
}

fn handle_annotate(args: AnnotateArgs, config: &Config) -> Result<()> {
    let AnnotateArgs {
        input,
        response,
        today,
        json,
    } = args;
    let records = normalizer(config, today)
        .read_file(&input)
        .with_context(|| format!("importing {:?}", input))?;
    let count = records.len();

    let mut session = AnnotationSession::new();
    let annotated = session
        .run(&FileAnnotator::new(response), records)
        .with_context(|| format!("annotating {count} record(s) from {:?}", input))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&annotated)?);
        return Ok(());
    }

    let review = ReviewState::from(annotated);
    if let Some(message) = &review.message {
        println!("{message}");
    }
    let counts = review.queue.counts();
    println!("records:     {count}");
    println!("posts:       {}", review.items.len());
    println!("conflicts:   {}", detect_conflicts(&review.items).len());
    println!(
        "flagged:     {} ({} critical, {} warning)",
        review.queue.len(),
        counts.critical,
        counts.warning
    );
    println!("suggestions: {}", review.board.active().len());
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing JSON {:?}", path))
}

fn parse_resolution(raw: &str) -> Result<(String, ResolutionAction), String> {
    let (id, action) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected <id>=<action>, got {raw:?}"))?;
    if id.trim().is_empty() {
        return Err(format!("missing item id in {raw:?}"));
    }
    let action = action.trim().parse().map_err(|e| format!("{e}"))?;
    Ok((id.trim().to_string(), action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use postline::core::{ChangeField, FieldChange, SuggestionKind};
    use pretty_assertions::assert_eq;

    fn write_json(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write fixture");
        path
    }

    fn suggestion(id: &str, post: &str, time: &str) -> Suggestion {
        Suggestion {
            id: id.into(),
            kind: SuggestionKind::OptimalTime,
            title: String::new(),
            description: String::new(),
            impact: String::new(),
            affected_posts: vec![],
            changes: vec![FieldChange::new(post, ChangeField::Time, time)],
        }
    }

    #[test]
    fn parse_resolution_reads_id_and_action() {
        assert_eq!(
            parse_resolution("f-1=accept").expect("parse"),
            ("f-1".to_string(), ResolutionAction::Accept)
        );
        assert!(parse_resolution("f-1").is_err());
        assert!(parse_resolution("=skip").is_err());
        assert!(parse_resolution("f-1=approve").is_err());
    }

    #[test]
    fn read_json_reports_the_failing_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = write_json(tmp.path(), "posts.json", "[{\"id\": 1}");
        let err = read_json::<Vec<ScheduleItem>>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("posts.json"));
    }

    #[test]
    fn apply_requested_honours_selection() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let posts = write_json(
            tmp.path(),
            "posts.json",
            r#"[
                {"id": 1, "title": "A", "platform": "instagram", "date": "2025-11-25", "time": "10:00", "status": "draft"},
                {"id": 2, "title": "B", "platform": "instagram", "date": "2025-11-25", "time": "10:00", "status": "draft"}
            ]"#,
        );
        let items: Vec<ScheduleItem> = read_json(&posts).expect("posts");
        let suggestions = vec![suggestion("s1", "2", "14:00"), suggestion("s2", "1", "08:00")];

        let applied =
            apply_requested(&items, suggestions.clone(), &["s1".into(), "s1".into()], false)
                .expect("apply");
        assert_eq!(applied.applied_ids, vec!["s1".to_string()]);
        assert_eq!(applied.items[1].time, "14:00");
        assert!(detect_conflicts(&applied.items).is_empty());

        let all = apply_requested(&items, suggestions.clone(), &[], true).expect("apply all");
        assert_eq!(all.applied_ids.len(), 2);

        assert!(apply_requested(&items, suggestions.clone(), &[], false).is_err());
        assert!(apply_requested(&items, suggestions, &["nope".into()], false).is_err());
    }

    #[test]
    fn run_triage_applies_single_then_bulk() {
        let flagged: Vec<FlaggedItem> = serde_json::from_str(
            r#"[
                {"id": "a", "taskTitle": "A", "issue": {"type": "broken-link", "severity": "warning"},
                 "suggestion": {"text": "fix", "confidence": 50}, "actions": ["skip"]},
                {"id": "b", "taskTitle": "B", "issue": {"type": "missing-asset", "severity": "critical"},
                 "suggestion": {"text": "fix", "confidence": 50}, "actions": ["accept", "edit"]}
            ]"#,
        )
        .expect("flags");
        let config = Config::default();

        let (queue, resolutions) = run_triage(
            TriageQueue::new(flagged.clone()),
            &[("b".into(), ResolutionAction::Edit)],
            None,
            &config,
        )
        .expect("triage");
        assert_eq!(queue.len(), 1);
        assert_eq!(resolutions[0].item_id, "b");

        let (queue, resolutions) = run_triage(
            TriageQueue::new(flagged.clone()),
            &[],
            bulk_action(true, false),
            &config,
        )
        .expect("fix all");
        assert!(queue.is_empty());
        assert_eq!(resolutions.len(), 2);

        assert!(
            run_triage(
                TriageQueue::new(flagged),
                &[("a".into(), ResolutionAction::Accept)],
                None,
                &config,
            )
            .is_err()
        );
    }
}
