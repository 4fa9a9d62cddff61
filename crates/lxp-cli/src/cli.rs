use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use lxp_store::BucketKind;

#[derive(Parser)]
#[command(
    name = "lxp",
    about = "LXP: persistent store for semi-structured records",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store root directory (overrides the config file)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum KindArg {
    Directory,
    Indexed,
}

impl From<KindArg> for BucketKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Directory => BucketKind::Directory,
            KindArg::Indexed => BucketKind::Indexed,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Create (or open) a store and print its state
    Init,
    /// Manage repositories
    Repo(RepoArgs),
    /// Manage buckets
    Bucket(BucketArgs),
    /// Persist a record given as a JSON object
    Put(PutArgs),
    /// Print a record
    Get(RecordArgs),
    /// Delete a record
    Delete(RecordArgs),
    /// List the records of a bucket
    List(ListArgs),
    /// Manage record types
    Type(TypeArgs),
    /// Start the LXP server
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct RepoArgs {
    #[command(subcommand)]
    pub action: RepoAction,
}

#[derive(Subcommand)]
pub enum RepoAction {
    Create { name: String },
    List,
    Delete { name: String },
}

#[derive(Args)]
pub struct BucketArgs {
    #[command(subcommand)]
    pub action: BucketAction,
}

#[derive(Subcommand)]
pub enum BucketAction {
    Create {
        repo: String,
        name: String,
        #[arg(long, default_value = "directory")]
        kind: KindArg,
    },
    List {
        repo: String,
    },
    Delete {
        repo: String,
        name: String,
    },
    /// Reclaim space held by overwritten and deleted records
    Compact {
        repo: String,
        name: String,
    },
}

#[derive(Args)]
pub struct PutArgs {
    pub repo: String,
    pub bucket: String,
    /// Record fields as a JSON object, or `-` to read stdin
    pub json: String,
    /// Registered type to tag the record with
    #[arg(short = 't', long = "type")]
    pub type_name: Option<String>,
}

#[derive(Args)]
pub struct RecordArgs {
    pub repo: String,
    pub bucket: String,
    pub oid: String,
}

#[derive(Args)]
pub struct ListArgs {
    pub repo: String,
    pub bucket: String,
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct TypeArgs {
    #[command(subcommand)]
    pub action: TypeAction,
}

#[derive(Subcommand)]
pub enum TypeAction {
    /// Register a type from a descriptor such as '["age", "address"]'
    Create { name: String, descriptor: String },
    List,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Listen address (overrides the config file)
    #[arg(long)]
    pub bind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_with_root() {
        let cli = Cli::try_parse_from(["lxp", "--root", "/tmp/s", "init"]).unwrap();
        assert!(matches!(cli.command, Command::Init));
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/s")));
    }

    #[test]
    fn parse_repo_create() {
        let cli = Cli::try_parse_from(["lxp", "repo", "create", "census"]).unwrap();
        if let Command::Repo(args) = cli.command {
            assert!(matches!(args.action, RepoAction::Create { ref name } if name == "census"));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_bucket_create_kind() {
        let cli = Cli::try_parse_from(["lxp", "bucket", "create", "r", "b", "--kind", "indexed"]).unwrap();
        if let Command::Bucket(args) = cli.command {
            assert!(matches!(args.action, BucketAction::Create { kind: KindArg::Indexed, .. }));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_bucket_default_kind() {
        let cli = Cli::try_parse_from(["lxp", "bucket", "create", "r", "b"]).unwrap();
        if let Command::Bucket(args) = cli.command {
            assert!(matches!(args.action, BucketAction::Create { kind: KindArg::Directory, .. }));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_bucket_compact() {
        let cli = Cli::try_parse_from(["lxp", "bucket", "compact", "r", "b"]).unwrap();
        if let Command::Bucket(args) = cli.command {
            assert!(matches!(args.action, BucketAction::Compact { .. }));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_put_typed() {
        let cli = Cli::try_parse_from(["lxp", "put", "r", "b", r#"{"age":"42"}"#, "--type", "person"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.type_name, Some("person".into()));
            assert_eq!(args.json, r#"{"age":"42"}"#);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_get() {
        let cli = Cli::try_parse_from(["lxp", "get", "r", "b", "7"]).unwrap();
        if let Command::Get(args) = cli.command {
            assert_eq!(args.oid, "7");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_list_limit() {
        let cli = Cli::try_parse_from(["lxp", "list", "r", "b", "-n", "5"]).unwrap();
        if let Command::List(args) = cli.command {
            assert_eq!(args.limit, Some(5));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_type_create() {
        let cli = Cli::try_parse_from(["lxp", "type", "create", "person", r#"["age"]"#]).unwrap();
        if let Command::Type(args) = cli.command {
            assert!(matches!(args.action, TypeAction::Create { .. }));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_serve() {
        let cli = Cli::try_parse_from(["lxp", "serve", "--bind", "0.0.0.0:8080"]).unwrap();
        if let Command::Serve(args) = cli.command {
            assert_eq!(args.bind, Some("0.0.0.0:8080".into()));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_globals_after_subcommand() {
        let cli = Cli::try_parse_from(["lxp", "repo", "list", "--format", "json", "-v"]).unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        assert!(cli.verbose);
    }

    #[test]
    fn reject_unknown_kind() {
        assert!(Cli::try_parse_from(["lxp", "bucket", "create", "r", "b", "--kind", "hash"]).is_err());
    }
}
