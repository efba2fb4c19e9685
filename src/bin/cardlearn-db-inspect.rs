//! Developer utility to list the classes, sample counts and saved model of a dataset database.

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;

use cardlearn::classifier::ClassifierModel;
use cardlearn::{app_dirs, config};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let Some(options) = parse_args(std::env::args().skip(1).collect())? else {
        return Ok(());
    };
    let db_path = match options.db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    println!("DB: {}", db_path.display());
    if let Ok(meta) = std::fs::metadata(&db_path) {
        println!("Size: {} bytes", meta.len());
    }

    let uri = format!("file:{}?mode=ro", db_path.display());
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|err| err.to_string())?;

    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|err| err.to_string())?;
    println!("Schema version: {version}");
    let next_id: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'next_id'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| err.to_string())?;
    println!("Next key counter: {}", next_id.as_deref().unwrap_or("0"));

    println!();
    println!("Classes:");
    let mut stmt = conn
        .prepare(
            "SELECT c.card_key, c.name, COUNT(f.position)
             FROM cards c
             LEFT JOIN card_features f ON f.card_key = c.card_key
             GROUP BY c.card_key
             ORDER BY c.card_key",
        )
        .map_err(|err| err.to_string())?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(|err| err.to_string())?;
    let mut classes = 0usize;
    for row in rows {
        let (key, name, samples) = row.map_err(|err| err.to_string())?;
        let mark = if samples >= options.min_samples as i64 {
            "ready"
        } else {
            "needs data"
        };
        println!("- {key}: {name} ({samples} samples, {mark})");
        classes += 1;
    }
    if classes == 0 {
        println!("- (none)");
    }

    println!();
    println!("Saved model:");
    let saved: Option<(String, i64)> = conn
        .query_row(
            "SELECT payload, saved_at FROM model_artifacts WHERE name = 'classifier'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|err| err.to_string())?;
    match saved {
        None => println!("- (none)"),
        Some((payload, saved_at)) => {
            println!("- saved_at={saved_at} bytes={}", payload.len());
            match serde_json::from_str::<ClassifierModel>(&payload) {
                Ok(model) => {
                    let keys: Vec<String> =
                        model.class_keys.iter().map(ToString::to_string).collect();
                    println!(
                        "- classes=[{}] input_len={} hidden_units={}",
                        keys.join(", "),
                        model.input_len,
                        model.hidden_units
                    );
                    if let Some(metrics) = model.metrics {
                        println!(
                            "- epochs={} samples={} loss={:.4} accuracy={:.3}",
                            metrics.epochs, metrics.samples, metrics.loss, metrics.accuracy
                        );
                    }
                    if let Err(reason) = model.validate() {
                        println!("- invalid: {reason}");
                    }
                }
                Err(err) => println!("- unreadable payload: {err}"),
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
struct CliOptions {
    db_path: Option<PathBuf>,
    min_samples: usize,
}

fn parse_args(args: Vec<String>) -> Result<Option<CliOptions>, String> {
    let mut db_path: Option<PathBuf> = None;
    let mut min_samples: Option<usize> = None;
    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => {
                println!("{}", help_text());
                return Ok(None);
            }
            "--db" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--db requires a value".to_string())?;
                db_path = Some(PathBuf::from(value));
            }
            "--min-samples" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--min-samples requires a value".to_string())?;
                min_samples = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid --min-samples value: {value}"))?,
                );
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }

    let min_samples = match min_samples {
        Some(value) => value,
        None => {
            config::load_or_default()
                .map_err(|err| err.to_string())?
                .training
                .min_samples
        }
    };
    Ok(Some(CliOptions {
        db_path,
        min_samples,
    }))
}

fn default_db_path() -> Result<PathBuf, String> {
    let settings = config::load_or_default().map_err(|err| err.to_string())?;
    let root = app_dirs::app_root_dir().map_err(|err| err.to_string())?;
    Ok(root.join(settings.storage.database_file))
}

fn help_text() -> String {
    [
        "cardlearn-db-inspect",
        "",
        "Usage:",
        "  cardlearn-db-inspect [--db <path-to-dataset.db>] [--min-samples <n>]",
        "",
        "Defaults to the dataset configured under the app root.",
    ]
    .join("\n")
}
