#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use pagekv::config::{self, Options};
use pagekv::storage::{Database, Transaction, TransactionError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: pagekv [<file>] <command> [args]

commands:
  collections                 list collection names
  create <collection>         create a collection
  drop <collection>           delete a collection and its items
  get <collection> <key>      print the value of a key
  put <collection> <key> <v>  set a key
  delete <collection> <key>   remove a key
  scan <collection> [prefix]  print items, optionally only those with a prefix
  stats                       print database statistics

<file> defaults to $PAGEKV_PATH. $PAGEKV_PAGE_SIZE sets the page size of new files.";

/// A parsed CLI command.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Collections,
    Create(String),
    Drop(String),
    Get(String, String),
    Put(String, String, String),
    Delete(String, String),
    Scan(String, Option<String>),
    Stats,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        let (name, rest) = args.split_first()?;
        let command = match (name.as_str(), rest) {
            ("collections", []) => Self::Collections,
            ("create", [c]) => Self::Create(c.clone()),
            ("drop", [c]) => Self::Drop(c.clone()),
            ("get", [c, k]) => Self::Get(c.clone(), k.clone()),
            ("put", [c, k, v]) => Self::Put(c.clone(), k.clone(), v.clone()),
            ("delete", [c, k]) => Self::Delete(c.clone(), k.clone()),
            ("scan", [c]) => Self::Scan(c.clone(), None),
            ("scan", [c, p]) => Self::Scan(c.clone(), Some(p.clone())),
            ("stats", []) => Self::Stats,
            _ => return None,
        };
        Some(command)
    }

    const fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create(_) | Self::Drop(_) | Self::Put(..) | Self::Delete(..)
        )
    }
}

const COMMANDS: [&str; 8] = [
    "collections",
    "create",
    "drop",
    "get",
    "put",
    "delete",
    "scan",
    "stats",
];

/// Split the arguments into a database path and a command.
fn parse_args(args: &[String]) -> Result<(PathBuf, Command), String> {
    let (path, command_args) = match args.first() {
        Some(first) if !COMMANDS.contains(&first.as_str()) => (PathBuf::from(first), &args[1..]),
        _ => (config::database_path_from_env().map_err(|e| e.to_string())?, args),
    };
    let command = Command::parse(command_args).ok_or_else(|| USAGE.to_string())?;
    Ok((path, command))
}

fn collection_not_found(name: &str) -> TransactionError {
    TransactionError::CollectionNotFound(name.to_string())
}

/// Execute `command` in `tx`, returning the lines to print.
fn execute(tx: &mut Transaction<'_>, command: &Command) -> Result<Vec<String>, TransactionError> {
    let lines = match command {
        Command::Collections => tx
            .collections()?
            .iter()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect(),
        Command::Create(c) => {
            tx.create_collection(c.as_bytes())?;
            vec![format!("created {c}")]
        }
        Command::Drop(c) => {
            tx.delete_collection(c.as_bytes())?;
            vec![format!("dropped {c}")]
        }
        Command::Get(c, k) => {
            let collection = tx
                .get_collection(c.as_bytes())?
                .ok_or_else(|| collection_not_found(c))?;
            collection
                .get(k.as_bytes())?
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .into_iter()
                .collect()
        }
        Command::Put(c, k, v) => {
            let mut collection = tx
                .get_collection(c.as_bytes())?
                .ok_or_else(|| collection_not_found(c))?;
            collection.put(k.as_bytes(), v.as_bytes())?;
            Vec::new()
        }
        Command::Delete(c, k) => {
            let mut collection = tx
                .get_collection(c.as_bytes())?
                .ok_or_else(|| collection_not_found(c))?;
            if collection.remove(k.as_bytes())? {
                Vec::new()
            } else {
                vec![format!("{k} not found")]
            }
        }
        Command::Scan(c, prefix) => {
            let collection = tx
                .get_collection(c.as_bytes())?
                .ok_or_else(|| collection_not_found(c))?;
            let items = match prefix {
                Some(p) => collection.scan_prefix(p.as_bytes())?,
                None => collection.items()?,
            };
            items
                .iter()
                .map(|item| {
                    format!(
                        "{}\t{}",
                        String::from_utf8_lossy(&item.key),
                        String::from_utf8_lossy(&item.value)
                    )
                })
                .collect()
        }
        Command::Stats => Vec::new(),
    };
    Ok(lines)
}

/// `$PAGEKV_PAGE_SIZE` only shapes new files; an existing file keeps its own page size.
fn open_options(path: &Path, from_env: Options) -> Options {
    let exists = std::fs::metadata(path).is_ok_and(|m| m.len() > 0);
    if exists {
        Options::default()
    } else {
        from_env
    }
}

fn run(path: &Path, command: &Command) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let options = open_options(path, Options::from_env()?);
    let db = Database::open(path, options)?;

    let lines = if *command == Command::Stats {
        let stats = db.stats()?;
        vec![
            format!("page size:     {}", stats.page_size),
            format!("commit:        {}", stats.tx_id),
            format!("root page:     {}", stats.root),
            format!("total pages:   {}", stats.total_pages),
            format!("free pages:    {}", stats.free_pages),
            format!("pending pages: {}", stats.pending_pages),
        ]
    } else if command.is_write() {
        db.update(|tx| execute(tx, command))?
    } else {
        db.view(|tx| execute(tx, command))?
    };

    db.close()?;
    Ok(lines)
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagekv=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (path, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    match run(&path, &command) {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}: {e}", path.display());
            ExitCode::FAILURE
        }
    }
}
