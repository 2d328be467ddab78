#![allow(dead_code)]

use std::path::PathBuf;

use tracing::Level;

mod ao;
mod client;
mod commands;
mod config;
mod control;
mod db;
mod duration;
mod net;
mod perms;
mod room;
mod sc;
mod server;
mod uid;

fn usage_and_exit() -> ! {
    eprintln!(
        "scsd (chat server)\n\n\
USAGE:\n  scsd [--config DIR] [--db PATH]\n\n\
ENV:\n  SCSD_CONFIG_DIR  default ./config\n  SCSD_DB_PATH     default ./database.sqlite\n"
    );
    std::process::exit(2);
}

struct Args {
    config_dir: PathBuf,
    db_path: String,
}

fn parse_args() -> Args {
    let mut config_dir =
        PathBuf::from(std::env::var("SCSD_CONFIG_DIR").unwrap_or_else(|_| "config".to_string()));
    let mut db_path =
        std::env::var("SCSD_DB_PATH").unwrap_or_else(|_| "database.sqlite".to_string());

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                config_dir = PathBuf::from(v);
            }
            "--db" => {
                db_path = it.next().unwrap_or_else(|| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Args {
        config_dir,
        db_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scsd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::TRACE)
        .init();

    let args = parse_args();
    let bundle = config::load(&args.config_dir)?;
    let db = db::Database::open(&args.db_path)?;
    let srv = server::Server::new(bundle, db)?;
    srv.run().await
}
