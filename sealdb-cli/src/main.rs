use clap::{Parser, Subcommand, ValueEnum};
use sealdb::{Filter, QueryOptions, SearchOptions, SearchQuery, SortSpec, Store, StoreConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;

/// SealDB CLI: inspect and edit an encrypted SealDB file from the command line
#[derive(Parser)]
#[command(name = "sealdb", version, about)]
struct Cli {
    /// Path to the encrypted database file
    #[arg(long, env = "SEALDB_PATH", default_value = "sealdb.db")]
    db: PathBuf,

    /// Secret the file key is derived from
    #[arg(long, env = "SEALDB_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// YAML or JSON config file; replaces --db and --secret
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Print the value stored under a key
    Get { key: String },

    /// Store a value (parsed as JSON, otherwise taken as a string)
    Set { key: String, value: String },

    /// Delete a key and its links
    Delete {
        key: String,
        /// Show the value that would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },

    /// List all keys
    Keys,

    /// Append to an array value
    Push { key: String, value: String },

    /// Remove every equal element from an array value
    Pull { key: String, value: String },

    /// Run a JSON filter (e.g. '{"age": {"$gt": 30}}')
    Query {
        filter: String,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        /// Sort field, or a JSON object such as '{"age": -1}'
        #[arg(long)]
        sort: Option<String>,
        /// Include the evaluation plan
        #[arg(long)]
        explain: bool,
    },

    /// Search values for a term, or a JSON array/object of terms
    Search {
        term: String,
        #[arg(long)]
        case_sensitive: bool,
        #[arg(long)]
        exact: bool,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Query with a plain-English phrase (e.g. "age greater than 30")
    Ask {
        text: String,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Link two keys
    Link { source: String, target: String },

    /// Remove a link between two keys
    Unlink { source: String, target: String },

    /// Show outgoing and incoming links of a key
    Links { key: String },

    /// Report links that reference missing keys
    Integrity {
        /// Remove the dangling edges
        #[arg(long)]
        repair: bool,
    },

    /// Manage schemas
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },

    /// Show store statistics
    Stats,

    /// Copy the database file
    Backup {
        /// Target path (default: next to the database, timestamped)
        target: Option<PathBuf>,
        /// Write a .meta file alongside the backup
        #[arg(long)]
        meta: bool,
    },

    /// Replace the database with a backup
    Restore {
        source: PathBuf,
        /// Do not keep a pre-restore copy of the current file
        #[arg(long)]
        no_safety_copy: bool,
    },

    /// List backups in a directory (default: the database's directory)
    Backups { dir: Option<PathBuf> },

    /// Re-encrypt the database under a new secret
    RotateKey { new_secret: String },
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Register a schema for a key or key prefix (YAML or JSON file)
    Set { key: String, file: PathBuf },
    /// Print the schema registered for a key
    Get { key: String },
    /// Remove a schema
    Remove { key: String },
    /// List all schemas
    List,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn open_store(cli: &Cli) -> Result<Store, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => {
            let secret = cli
                .secret
                .clone()
                .ok_or("a secret is required (--secret or SEALDB_SECRET)")?;
            StoreConfig::new(&cli.db, secret)
        }
    };
    log::debug!("Opening {}", config.path.display());
    Ok(Store::open(config)?)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&cli)?;

    match cli.command {
        Command::Get { key } => {
            let value = store.get(&key).ok_or_else(|| format!("Not found: {key}"))?;
            print_output(&value, &cli.format)?;
        }

        Command::Set { key, value } => {
            store.set(&key, parse_value(&value))?;
            print_output(&json!({ "ok": true, "key": key }), &cli.format)?;
        }

        Command::Delete { key, dry_run } => {
            if dry_run {
                print_output(
                    &json!({
                        "dry_run": true,
                        "would_delete": key,
                        "value": store.get(&key),
                        "linked": store.neighbors(&key),
                    }),
                    &cli.format,
                )?;
            } else {
                let deleted = store.delete(&key)?;
                print_output(&json!({ "ok": true, "deleted": deleted }), &cli.format)?;
            }
        }

        Command::Keys => {
            print_output(&json!(store.keys()), &cli.format)?;
        }

        Command::Push { key, value } => {
            let len = store.push(&key, parse_value(&value))?;
            print_output(&json!({ "ok": true, "length": len }), &cli.format)?;
        }

        Command::Pull { key, value } => {
            let removed = store.pull(&key, &parse_value(&value))?;
            print_output(&json!({ "ok": true, "removed": removed }), &cli.format)?;
        }

        Command::Query {
            filter,
            limit,
            skip,
            sort,
            explain,
        } => {
            let filter: Value = serde_json::from_str(&filter)
                .map_err(|e| format!("Invalid filter JSON: {e}"))?;
            let mut options = QueryOptions::default().limit(limit).skip(skip).explain(explain);
            options.sort = sort.map(|s| parse_sort(&s));
            let outcome = store.query(&Filter::from(filter), &options);
            print_output(&serde_json::to_value(&outcome)?, &cli.format)?;
        }

        Command::Search {
            term,
            case_sensitive,
            exact,
            limit,
        } => {
            let options = SearchOptions {
                case_sensitive,
                exact_match: exact,
                limit,
                ..SearchOptions::default()
            };
            let hits = store.search(&SearchQuery::from(parse_value(&term)), &options);
            print_output(&serde_json::to_value(&hits)?, &cli.format)?;
        }

        Command::Ask { text, limit } => {
            let outcome = store.natural_query(&text, &QueryOptions::default().limit(limit));
            print_output(&serde_json::to_value(&outcome)?, &cli.format)?;
        }

        Command::Link { source, target } => {
            store.link(&source, &target)?;
            print_output(&json!({ "ok": true }), &cli.format)?;
        }

        Command::Unlink { source, target } => {
            let removed = store.unlink(&source, &target)?;
            print_output(&json!({ "ok": true, "removed": removed }), &cli.format)?;
        }

        Command::Links { key } => {
            print_output(
                &json!({
                    "key": key,
                    "links": store.links(&key),
                    "linked_to": store.linked_to(&key),
                }),
                &cli.format,
            )?;
        }

        Command::Integrity { repair } => {
            if repair {
                let report = store.repair_link_integrity()?;
                print_output(&serde_json::to_value(report)?, &cli.format)?;
            } else {
                let violations = store.validate_link_integrity();
                print_output(
                    &json!({ "valid": violations.is_empty(), "violations": violations }),
                    &cli.format,
                )?;
            }
        }

        Command::Schema { action } => match action {
            SchemaAction::Set { key, file } => {
                let schema = sealdb::schema::parse_schema(&file)?;
                store.set_schema(&key, schema.to_value())?;
                print_output(&json!({ "ok": true, "key": key }), &cli.format)?;
            }
            SchemaAction::Get { key } => {
                let schema = store
                    .get_schema(&key)
                    .ok_or_else(|| format!("No schema for '{key}'"))?;
                print_output(&schema.to_value(), &cli.format)?;
            }
            SchemaAction::Remove { key } => {
                let removed = store.remove_schema(&key)?;
                print_output(&json!({ "ok": true, "removed": removed }), &cli.format)?;
            }
            SchemaAction::List => {
                print_output(&serde_json::to_value(store.schemas())?, &cli.format)?;
            }
        },

        Command::Stats => {
            print_output(&serde_json::to_value(store.stats())?, &cli.format)?;
        }

        Command::Backup { target, meta } => {
            let path = store.backup(target.as_deref(), meta)?;
            print_output(&json!({ "ok": true, "backup": path }), &cli.format)?;
        }

        Command::Restore {
            source,
            no_safety_copy,
        } => {
            let safety = store.restore(&source, !no_safety_copy)?;
            print_output(
                &json!({ "ok": true, "restored": source, "pre_restore": safety }),
                &cli.format,
            )?;
        }

        Command::Backups { dir } => {
            let entries = store.list_backups(dir.as_deref())?;
            print_output(&serde_json::to_value(entries)?, &cli.format)?;
        }

        Command::RotateKey { new_secret } => {
            store.rotate_key(&new_secret)?;
            print_output(&json!({ "ok": true, "rotated": true }), &cli.format)?;
        }
    }

    store.flush()?;
    Ok(())
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_sort(raw: &str) -> SortSpec {
    SortSpec::from_value(&parse_value(raw)).unwrap_or_else(|| SortSpec::Field(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_falls_back_to_string() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("[1, \"a\"]"), json!([1, "a"]));
        assert_eq!(parse_value("hello world"), json!("hello world"));
    }

    #[test]
    fn test_parse_sort() {
        assert_eq!(parse_sort("age"), SortSpec::Field("age".into()));
        assert_eq!(
            parse_sort(r#"{"age": -1}"#),
            SortSpec::Fields(vec![("age".into(), sealdb::SortDirection::Desc)])
        );
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "sealdb", "--db", "x.db", "--secret", "k", "query", r#"{"a": 1}"#, "--limit", "5",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Query { limit: 5, .. }));

        let cli = Cli::try_parse_from(["sealdb", "--secret", "k", "schema", "get", "user:"]).unwrap();
        assert!(matches!(cli.command, Command::Schema { action: SchemaAction::Get { .. } }));
    }
}
