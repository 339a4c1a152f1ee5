use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use toml::Table;

use tunnel_fleet::config::load_or_default;
use tunnel_fleet::document::{parse_table, table_from_json, ConnectionSettings};
use tunnel_fleet::observability::logging;
use tunnel_fleet::{Fleet, FleetError};

#[derive(Parser)]
#[command(name = "fleet-cli")]
#[command(about = "Edit tunnel client documents of a fleet", long_about = None)]
struct Cli {
    /// Engine settings file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tunnels (`[[proxies]]`) of one client
    Tunnel {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Manage listeners (`[[visitors]]`) of one client
    Listener {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Manage the connection settings of one client
    Connection {
        #[command(subcommand)]
        action: ConnectionAction,
    },
    /// Every tunnel in the fleet with its route
    Overview {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    /// List records of a client
    List { client: String },
    /// Show one record
    Show { client: String, name: String },
    /// Create a record from a TOML snippet
    Add {
        client: String,
        #[command(flatten)]
        payload: Payload,
    },
    /// Merge a TOML snippet into an existing record
    Update {
        client: String,
        name: String,
        #[command(flatten)]
        payload: Payload,
    },
    /// Delete a record
    Rm { client: String, name: String },
}

#[derive(Subcommand)]
enum ConnectionAction {
    Show { client: String },
    /// Write the first document of a client
    Create {
        client: String,
        #[command(flatten)]
        payload: Payload,
    },
    /// Merge a TOML snippet into the connection settings
    Update {
        client: String,
        #[command(flatten)]
        payload: Payload,
    },
}

/// TOML (or a JSON object) given inline or read from a file.
#[derive(Args)]
struct Payload {
    /// Inline TOML, e.g. "name = 'ssh'\ntype = 'tcp'\nremotePort = 2222", or a JSON object
    #[arg(conflicts_with = "file", required_unless_present = "file")]
    toml: Option<String>,

    #[arg(short, long)]
    file: Option<PathBuf>,
}

impl Payload {
    fn table(&self) -> Result<Table, Box<dyn std::error::Error>> {
        let text = match (&self.toml, &self.file) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)?,
            (None, None) => return Err("a TOML payload or --file is required".into()),
        };
        if text.trim_start().starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(&text)?;
            return Ok(table_from_json(value)?);
        }
        match self.toml {
            Some(_) => Ok(parse_table(&text.replace("\\n", "\n"))?),
            None => Ok(parse_table(&text)?),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        match e.downcast_ref::<FleetError>() {
            Some(fleet_error) => eprintln!("Error ({:?}): {}", fleet_error.kind(), fleet_error),
            None => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_or_default(cli.config.as_deref())?;
    logging::init_logging("warn");
    let fleet = Fleet::from_config(&config);

    match cli.command {
        Commands::Tunnel { action } => match action {
            RecordAction::List { client } => print_toml_list("proxies", &fleet.list_tunnels(&client)?)?,
            RecordAction::Show { client, name } => print_toml(&fleet.get_tunnel(&client, &name)?)?,
            RecordAction::Add { client, payload } => print_toml(&fleet.create_tunnel(&client, payload.table()?)?)?,
            RecordAction::Update { client, name, payload } => {
                print_toml(&fleet.update_tunnel(&client, &name, payload.table()?)?)?
            }
            RecordAction::Rm { client, name } => {
                fleet.delete_tunnel(&client, &name)?;
                println!("deleted tunnel `{name}` of client {client}");
            }
        },
        Commands::Listener { action } => match action {
            RecordAction::List { client } => print_toml_list("visitors", &fleet.list_listeners(&client)?)?,
            RecordAction::Show { client, name } => print_toml(&fleet.get_listener(&client, &name)?)?,
            RecordAction::Add { client, payload } => {
                print_toml(&fleet.create_listener(&client, payload.table()?)?)?
            }
            RecordAction::Update { client, name, payload } => {
                print_toml(&fleet.update_listener(&client, &name, payload.table()?)?)?
            }
            RecordAction::Rm { client, name } => {
                fleet.delete_listener(&client, &name)?;
                println!("deleted listener `{name}` of client {client}");
            }
        },
        Commands::Connection { action } => match action {
            ConnectionAction::Show { client } => print_toml(&fleet.connection(&client)?)?,
            ConnectionAction::Create { client, payload } => {
                let connection = ConnectionSettings::from_table(payload.table()?)?;
                print!("{}", fleet.create_document(&client, connection)?.render()?);
            }
            ConnectionAction::Update { client, payload } => {
                print_toml(&fleet.update_connection(&client, payload.table()?)?)?
            }
        },
        Commands::Overview { json: true } => {
            println!("{}", serde_json::to_string_pretty(&fleet.tunnel_overview().await?)?);
        }
        Commands::Overview { json: false } => {
            for row in fleet.tunnel_overview().await? {
                let state = row.run_state.as_ref().map_or("-", |s| s.status.as_str());
                println!("{:<8} {:<20} {:<7} {:<10} {}", row.client_id, row.name, row.kind.as_str(), state, row.route);
            }
        }
    }
    Ok(())
}

fn print_toml<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", toml::to_string_pretty(value)?);
    Ok(())
}

fn print_toml_list<T: Serialize>(key: &str, records: &[T]) -> Result<(), Box<dyn std::error::Error>> {
    let mut root = Table::new();
    root.insert(key.to_string(), toml::Value::try_from(records)?);
    print!("{}", toml::to_string_pretty(&root)?);
    Ok(())
}
