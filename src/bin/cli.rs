use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use profiledb::client::Client;
use profiledb::config::Config;
use profiledb::info::render;
use profiledb::logging;
use profiledb::models::{Bin, Filter, IndexType, Key, Statement, Value};

#[derive(Parser)]
#[command(name = "profiledb-cli")]
#[command(about = "CLI for profiledb", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server host (overrides PROFILEDB_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port (overrides PROFILEDB_PORT)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args)]
struct KeyArgs {
    #[arg(short, long, default_value = "test")]
    namespace: String,
    #[arg(short, long)]
    set: String,
    /// Primary key
    key: String,
    /// Treat the key as an integer instead of a string
    #[arg(long)]
    int_key: bool,
}

impl KeyArgs {
    fn to_key(&self) -> Result<Key, Box<dyn std::error::Error>> {
        if self.int_key {
            let pk: i64 = self.key.parse()?;
            Ok(Key::new(self.namespace.as_str(), self.set.as_str(), pk))
        } else {
            Ok(Key::new(self.namespace.as_str(), self.set.as_str(), self.key.as_str()))
        }
    }
}

#[derive(Args)]
struct StatementArgs {
    #[arg(short, long, default_value = "test")]
    namespace: String,
    #[arg(short, long)]
    set: String,
    /// Equality filter, `bin=value`
    #[arg(long, value_parser = parse_equal, conflicts_with = "range")]
    equal: Option<Filter>,
    /// Inclusive range filter, `bin=low..high`
    #[arg(long, value_parser = parse_range)]
    range: Option<Filter>,
    /// Bins to return (comma separated)
    #[arg(long, value_delimiter = ',')]
    bins: Vec<String>,
}

impl StatementArgs {
    fn to_statement(&self) -> Statement {
        let mut stmt = Statement::new(self.namespace.as_str(), self.set.as_str());
        if let Some(filter) = self.equal.clone().or_else(|| self.range.clone()) {
            stmt = stmt.with_filter(filter);
        }
        if !self.bins.is_empty() {
            stmt = stmt.with_bins(self.bins.iter().cloned());
        }
        stmt
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a stream module and wait for it to compile
    RegisterUdf {
        path: PathBuf,
        #[arg(long)]
        no_wait: bool,
    },
    RemoveUdf {
        file_name: String,
    },
    /// Create a secondary index and wait for the build
    CreateIndex {
        #[arg(short, long, default_value = "test")]
        namespace: String,
        #[arg(short, long)]
        set: String,
        #[arg(long)]
        name: String,
        #[arg(short, long)]
        bin: String,
        #[arg(long)]
        numeric: bool,
        #[arg(long)]
        no_wait: bool,
    },
    DropIndex {
        #[arg(short, long, default_value = "test")]
        namespace: String,
        name: String,
    },
    /// Write bins given as `name=value`
    Put {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(short, long = "bin", value_parser = parse_bin, required = true)]
        bins: Vec<Bin>,
    },
    Get {
        #[command(flatten)]
        key: KeyArgs,
    },
    Delete {
        #[command(flatten)]
        key: KeyArgs,
    },
    Query {
        #[command(flatten)]
        statement: StatementArgs,
    },
    /// Run `module.function(args)` over the query's records
    Aggregate {
        #[command(flatten)]
        statement: StatementArgs,
        #[arg(short, long)]
        module: String,
        #[arg(short, long)]
        function: String,
        args: Vec<String>,
    },
    /// Print an info command's response (build, namespaces, sets, sindex, udf-list, statistics)
    Info {
        #[arg(default_value = "statistics")]
        command: String,
    },
}

/// `42` and `-7` are integers, `true`/`false` booleans, `nil` is nil;
/// everything else is a string.
fn parse_value(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Int(v);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "nil" => Value::Nil,
        _ => Value::from(raw),
    }
}

fn parse_bin(raw: &str) -> Result<Bin, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    Ok(Bin::new(name, parse_value(value)))
}

fn parse_equal(raw: &str) -> Result<Filter, String> {
    let (bin, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected bin=value, got {raw:?}"))?;
    Ok(Filter::equal(bin, parse_value(value)))
}

fn parse_range(raw: &str) -> Result<Filter, String> {
    let (bin, bounds) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected bin=low..high, got {raw:?}"))?;
    let (low, high) = bounds
        .split_once("..")
        .ok_or_else(|| format!("expected low..high, got {bounds:?}"))?;
    let low: i64 = low.trim().parse().map_err(|e| format!("bad low bound: {e}"))?;
    let high: i64 = high.trim().parse().map_err(|e| format!("bad high bound: {e}"))?;
    Ok(Filter::range(bin, low, high))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_cli(cli.verbose);

    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    let mut client = Client::connect(&config)?;

    match cli.command {
        Commands::RegisterUdf { path, no_wait } => {
            let task = client.register_udf(&path)?;
            if !no_wait {
                task.wait_till_complete()?;
            }
            println!("Registered {}", task.file_name());
        }
        Commands::RemoveUdf { file_name } => {
            client.remove_udf(&file_name)?;
            println!("Removed {file_name}");
        }
        Commands::CreateIndex {
            namespace,
            set,
            name,
            bin,
            numeric,
            no_wait,
        } => {
            let index_type = if numeric { IndexType::Numeric } else { IndexType::String };
            let task = client.create_index(&namespace, &set, &name, &bin, index_type)?;
            if !no_wait {
                task.wait_till_complete()?;
            }
            println!("Index {} on {namespace}.{set}({bin}) {index_type}", task.index_name());
        }
        Commands::DropIndex { namespace, name } => {
            client.drop_index(&namespace, &name)?;
            println!("Dropped {name}");
        }
        Commands::Put { key, bins } => {
            let key = key.to_key()?;
            client.put(&key, &bins)?;
            println!("Wrote {key}");
        }
        Commands::Get { key } => match client.get(&key.to_key()?)? {
            Some(record) => println!("Record: {record}"),
            None => println!("Not found"),
        },
        Commands::Delete { key } => {
            let key = key.to_key()?;
            if client.delete(&key)? {
                println!("Deleted {key}");
            } else {
                println!("Not found");
            }
        }
        Commands::Query { statement } => {
            let mut records = client.query(&statement.to_statement())?;
            let mut count = 0;
            while let Some(found) = records.next_record()? {
                println!("{}: {}", found.key, found.record);
                count += 1;
            }
            records.close()?;
            println!("{count} record(s)");
        }
        Commands::Aggregate {
            statement,
            module,
            function,
            args,
        } => {
            let args = args.iter().map(|a| parse_value(a)).collect();
            let mut results = client.query_aggregate(&statement.to_statement(), &module, &function, args)?;
            let mut count = 0;
            while let Some(value) = results.next_value()? {
                println!("Result: {value}");
                count += 1;
            }
            results.close()?;
            if count == 0 {
                println!("No results returned.");
            }
        }
        Commands::Info { command } => {
            let response = client.info(&command)?;
            print!("{}", render(&command, &response));
        }
    }

    client.close()?;
    Ok(())
}
