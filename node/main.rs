extern crate bytes;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rangestore;
extern crate tokio;
extern crate toml;

mod script;

use rangestore::transport::TcpTransport;
use rangestore::{Config, Store};
use std::io::Read;
use std::process::exit;
use std::sync::Arc;
use std::{env, fs, str};

fn config() -> (Config, u32, Option<String>) {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        println!("Usage: {} [config_file] [rank] [script_file]", args[0]);
        exit(1);
    }

    let config: Config = {
        let mut f = fs::File::open(&args[1]).expect("Unable to open config file");
        let mut bytes = vec![];
        f.read_to_end(&mut bytes)
            .expect("Unable to read config file");
        let cfg = str::from_utf8(&bytes).expect("Invalid UTF-8");
        toml::from_str(cfg).expect("Unable to parse TOML")
    };
    let rank: u32 = args[2].parse().expect("Invalid rank");

    info!("Starting rank {} with configuration {:?}", rank, config);
    (config, rank, args.get(3).cloned())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let (config, rank, script) = config();
    let commands = match script.as_ref().map(|path| script::load(path)).transpose() {
        Ok(commands) => commands.unwrap_or_default(),
        Err(e) => {
            error!("Unable to load script: {}", e);
            exit(1);
        }
    };

    let (transport, inbound) =
        match TcpTransport::bind(rank, config.group.ranks.clone(), config.store.max_message_bytes)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                error!("Unable to start transport: {}", e);
                exit(1);
            }
        };

    let store = match Store::open(config.store.clone(), Arc::new(transport), inbound).await {
        Ok(store) => store,
        Err(e) => {
            error!("Unable to open store: {}", e);
            exit(1);
        }
    };

    let failed = script::run(&store, commands).await;

    if let Err(e) = store.close().await {
        error!("Error closing store: {}", e);
        exit(1);
    }
    if failed > 0 {
        error!("{} commands failed", failed);
        exit(2);
    }
}
