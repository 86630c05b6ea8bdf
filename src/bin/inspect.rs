use clap::{Parser, Subcommand, ValueEnum};
use medcycle::{config::AppConfig, database::Database};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "medcycle-inspect")]
#[command(about = "Print marketplace records straight from the database")]
struct Args {
    #[arg(short, long, default_value = "medcycle.toml")]
    config: PathBuf,

    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// All registered organizations
    Users {
        #[arg(long)]
        pending: bool,
    },
    /// Listings with their sender
    Medicines {
        #[arg(long)]
        pending: bool,
    },
    /// Orders, newest first
    Orders,
    /// Marketplace totals
    Stats,
}

fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<String>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join("  ")
    };

    println!("{}", line(headers.iter().map(|h| h.to_string()).collect()));
    println!("{}", widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("  "));
    let count = rows.len();
    for row in rows {
        println!("{}", line(row));
    }
    println!("\n{} row(s)", count);
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_with_env_overrides(&args.config)?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    let db = Database::connect(&config.database).await?;

    match args.command {
        Command::Users { pending } => {
            let users = if pending {
                db.list_pending_users().await?
            } else {
                db.list_users().await?
            };
            match args.format {
                Format::Json => print_json(&users)?,
                Format::Table => print_table(
                    &["ID", "EMAIL", "ORGANIZATION", "TYPE", "PIN", "ROLE", "VERIFIED"],
                    users
                        .iter()
                        .map(|u| {
                            vec![
                                u.id.to_string(),
                                u.email.clone(),
                                u.organization_name.clone(),
                                u.user_type.as_str().to_string(),
                                u.pin_code.clone(),
                                u.role.to_string(),
                                u.is_verified.to_string(),
                            ]
                        })
                        .collect(),
                ),
            }
        }
        Command::Medicines { pending } => {
            let medicines = if pending {
                db.list_pending_medicines().await?
            } else {
                db.list_medicines().await?
            };
            match args.format {
                Format::Json => print_json(&medicines)?,
                Format::Table => print_table(
                    &["ID", "NAME", "COMPANY", "EXPIRY", "QTY", "PRICE", "STATUS", "SENDER"],
                    medicines
                        .iter()
                        .map(|v| {
                            let m = &v.medicine;
                            vec![
                                m.id.to_string(),
                                m.name.clone(),
                                m.company.clone(),
                                m.expiry_date.to_string(),
                                m.quantity.to_string(),
                                format!("{:.2}", m.cost_per_unit),
                                m.status.as_str().to_string(),
                                v.sender_name.clone(),
                            ]
                        })
                        .collect(),
                ),
            }
        }
        Command::Orders => {
            let orders = db.list_orders().await?;
            match args.format {
                Format::Json => print_json(&orders)?,
                Format::Table => print_table(
                    &["ID", "BUYER", "TOTAL", "PAYMENT", "DELIVERY", "CREATED"],
                    orders
                        .iter()
                        .map(|o| {
                            vec![
                                o.id.to_string(),
                                o.buyer_id.to_string(),
                                format!("{:.2}", o.total_amount),
                                o.payment_status.as_str().to_string(),
                                o.delivery_status.as_str().to_string(),
                                o.created_at.format("%Y-%m-%d %H:%M").to_string(),
                            ]
                        })
                        .collect(),
                ),
            }
        }
        Command::Stats => {
            let stats = db.system_stats().await?;
            match args.format {
                Format::Json => print_json(&stats)?,
                Format::Table => print_table(
                    &["METRIC", "VALUE"],
                    vec![
                        vec!["verified users".to_string(), stats.total_users.to_string()],
                        vec!["pending approvals".to_string(), stats.pending_approvals.to_string()],
                        vec!["approved medicines".to_string(), stats.total_medicines.to_string()],
                        vec!["pending medicines".to_string(), stats.pending_medicines.to_string()],
                        vec!["orders".to_string(), stats.total_orders.to_string()],
                        vec!["paid revenue".to_string(), format!("{:.2}", stats.paid_revenue)],
                    ],
                ),
            }
        }
    }

    Ok(())
}
