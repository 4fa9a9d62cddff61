use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context};
use colored::Colorize;
use lxp_server::handler::record_view;
use lxp_server::{LxpServer, ServerConfig};
use lxp_store::{BucketKind, BucketStreams, Store};
use lxp_types::{Lxp, Oid};
use serde_json::{json, Value};

use crate::cli::*;

/// Settings shared by every command.
struct Session {
    config: ServerConfig,
    format: OutputFormat,
}

impl Session {
    fn new(cli: &Cli) -> anyhow::Result<Self> {
        Ok(Self {
            config: resolve_config(cli.config.as_deref(), cli.root.clone())?,
            format: cli.format,
        })
    }

    fn open_store(&self) -> anyhow::Result<Store> {
        let root = &self.config.store.root;
        tracing::debug!(root = %root.display(), sync = ?self.config.store.sync, "opening store");
        Store::open(self.config.store.clone())
            .with_context(|| format!("cannot open store at {}", root.display()))
    }

    /// Print `value` as JSON, or run `text` for human output.
    fn emit(&self, value: Value, text: impl FnOnce()) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
            OutputFormat::Text => text(),
        }
        Ok(())
    }
}

/// Merge the config file (if any) with `--root`; `--root` wins.
fn resolve_config(
    path: Option<&std::path::Path>,
    root: Option<PathBuf>,
) -> anyhow::Result<ServerConfig> {
    match (path, root) {
        (Some(path), root) => {
            let mut config = ServerConfig::load(path)?;
            if let Some(root) = root {
                config.store.root = root;
            }
            Ok(config)
        }
        (None, Some(root)) => Ok(ServerConfig::new(root)),
        (None, None) => bail!("no store given: pass --root <DIR> or --config <FILE>"),
    }
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let session = Session::new(&cli)?;
    match cli.command {
        Command::Init => cmd_init(&session),
        Command::Repo(args) => cmd_repo(&session, args.action),
        Command::Bucket(args) => cmd_bucket(&session, args.action),
        Command::Put(args) => cmd_put(&session, args),
        Command::Get(args) => cmd_get(&session, args),
        Command::Delete(args) => cmd_delete(&session, args),
        Command::List(args) => cmd_list(&session, args),
        Command::Type(args) => cmd_type(&session, args.action),
        Command::Serve(args) => cmd_serve(session, args),
    }
}

fn cmd_init(session: &Session) -> anyhow::Result<()> {
    let store = session.open_store()?;
    let repos = store.repository_names();
    let types = store.type_factory().type_names();
    session.emit(
        json!({
            "root": store.root(),
            "repositories": repos,
            "types": types,
        }),
        || {
            println!("{} Store ready at {}", "✓".green().bold(), store.root().display().to_string().bold());
            println!("  Repositories: {}", repos.len());
            println!("  Types: {}", types.len());
        },
    )
}

fn cmd_repo(session: &Session, action: RepoAction) -> anyhow::Result<()> {
    let store = session.open_store()?;
    match action {
        RepoAction::Create { name } => {
            store.make_repository(&name)?;
            session.emit(json!({ "created": name }), || {
                println!("{} Created repository {}", "✓".green(), name.yellow())
            })
        }
        RepoAction::List => {
            let names = store.repository_names();
            session.emit(json!(names), || {
                if names.is_empty() {
                    println!("No repositories.");
                }
                for name in &names {
                    println!("{}", name.yellow());
                }
            })
        }
        RepoAction::Delete { name } => {
            store.delete_repository(&name)?;
            session.emit(json!({ "deleted": name }), || {
                println!("Deleted repository {}", name.yellow())
            })
        }
    }
}

fn cmd_bucket(session: &Session, action: BucketAction) -> anyhow::Result<()> {
    let store = session.open_store()?;
    match action {
        BucketAction::Create { repo, name, kind } => {
            let kind = BucketKind::from(kind);
            store.get_repository(&repo)?.make_bucket(&name, kind)?;
            session.emit(json!({ "created": name, "kind": kind }), || {
                println!("{} Created {} bucket {}/{}", "✓".green(), kind, repo, name.yellow())
            })
        }
        BucketAction::List { repo } => {
            let repository = store.get_repository(&repo)?;
            let mut rows = Vec::new();
            for name in repository.bucket_names()? {
                let bucket = repository.get_bucket(&name)?;
                rows.push((name, bucket.kind(), bucket.len()?));
            }
            let value = json!(rows
                .iter()
                .map(|(name, kind, len)| json!({ "name": name, "kind": kind, "records": len }))
                .collect::<Vec<_>>());
            session.emit(value, || {
                if rows.is_empty() {
                    println!("No buckets in {}.", repo.yellow());
                }
                for (name, kind, len) in &rows {
                    println!("{:<24} {:<10} {} records", name.yellow(), kind.to_string().cyan(), len);
                }
            })
        }
        BucketAction::Delete { repo, name } => {
            store.get_repository(&repo)?.delete_bucket(&name)?;
            session.emit(json!({ "deleted": name }), || {
                println!("Deleted bucket {}/{}", repo, name.yellow())
            })
        }
        BucketAction::Compact { repo, name } => {
            let reclaimed = store.bucket(&repo, &name)?.compact()?;
            session.emit(json!({ "reclaimed_bytes": reclaimed }), || {
                println!("{} Compacted {}/{}: {} bytes reclaimed", "✓".green(), repo, name.yellow(), reclaimed)
            })
        }
    }
}

fn read_fields(raw: &str) -> anyhow::Result<Value> {
    let source = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        raw.to_string()
    };
    serde_json::from_str(&source).context("record must be a JSON object")
}

fn cmd_put(session: &Session, args: PutArgs) -> anyhow::Result<()> {
    let store = session.open_store()?;
    let bucket = store.bucket(&args.repo, &args.bucket)?;
    let mut record = Lxp::from_json_object(&read_fields(&args.json)?)?;
    if let Some(name) = &args.type_name {
        let Some(label) = store.type_with_name(name) else {
            bail!("unknown type: {name}");
        };
        record.set_type(label.type_ref());
    }
    let oid = bucket.make_persistent(&mut record)?;
    session.emit(json!({ "oid": oid.as_u64() }), || {
        println!("{} Stored record {}", "✓".green().bold(), oid.to_string().yellow())
    })
}

fn print_record(record: &Lxp) {
    let oid = record.oid().map(|o| o.to_string()).unwrap_or_default();
    match record.get_type() {
        Some(t) => println!("{} ({})", oid.yellow().bold(), t.name().cyan()),
        None => println!("{}", oid.yellow().bold()),
    }
    for (label, value) in record.iter() {
        println!("  {} = {}", label.bold(), value.to_json());
    }
}

fn parse_oid(raw: &str) -> anyhow::Result<Oid> {
    raw.parse().with_context(|| format!("invalid oid {raw:?}"))
}

fn cmd_get(session: &Session, args: RecordArgs) -> anyhow::Result<()> {
    let oid = parse_oid(&args.oid)?;
    let store = session.open_store()?;
    let record = store.bucket(&args.repo, &args.bucket)?.get_object_by_id(oid)?;
    session.emit(record_view(&record), || print_record(&record))
}

fn cmd_delete(session: &Session, args: RecordArgs) -> anyhow::Result<()> {
    let oid = parse_oid(&args.oid)?;
    let store = session.open_store()?;
    store.bucket(&args.repo, &args.bucket)?.delete(oid)?;
    session.emit(json!({ "deleted": oid.as_u64() }), || {
        println!("Deleted record {}", oid.to_string().yellow())
    })
}

fn cmd_list(session: &Session, args: ListArgs) -> anyhow::Result<()> {
    let store = session.open_store()?;
    let bucket = store.bucket(&args.repo, &args.bucket)?;
    let limit = args.limit.unwrap_or(usize::MAX);
    let records = bucket
        .input_stream()?
        .take(limit)
        .collect::<Result<Vec<_>, _>>()?;
    session.emit(json!(records.iter().map(record_view).collect::<Vec<_>>()), || {
        if records.is_empty() {
            println!("No records.");
        }
        for record in &records {
            print_record(record);
        }
    })
}

fn cmd_type(session: &Session, action: TypeAction) -> anyhow::Result<()> {
    let store = session.open_store()?;
    match action {
        TypeAction::Create { name, descriptor } => {
            let label = store.create_type(&descriptor, &name)?;
            session.emit(
                json!({ "name": label.name(), "descriptor": label.descriptor().as_u64(), "labels": label.labels() }),
                || {
                    println!("{} Registered type {}", "✓".green(), label.name().cyan());
                    println!("  Labels: {}", label.labels().join(", "));
                },
            )
        }
        TypeAction::List => {
            let types: Vec<_> = store
                .type_factory()
                .type_names()
                .iter()
                .filter_map(|name| store.type_with_name(name))
                .collect();
            let value = json!(types
                .iter()
                .map(|t| json!({ "name": t.name(), "labels": t.labels() }))
                .collect::<Vec<_>>());
            session.emit(value, || {
                if types.is_empty() {
                    println!("No types registered.");
                }
                for t in &types {
                    println!("{:<24} {}", t.name().cyan(), t.labels().join(", "));
                }
            })
        }
    }
}

fn cmd_serve(session: Session, args: ServeArgs) -> anyhow::Result<()> {
    let mut config = session.config;
    if let Some(bind) = args.bind {
        config.bind_addr = bind
            .parse()
            .with_context(|| format!("invalid listen address {bind:?}"))?;
    }
    let server = LxpServer::open(config)?;
    println!(
        "LXP server on {} (root: {})",
        server.config().bind_addr.to_string().bold(),
        server.store().root().display()
    );
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server.serve())?;
    Ok(())
}
