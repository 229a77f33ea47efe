extern crate bytes;
extern crate env_logger;
extern crate futures;
extern crate getopts;
extern crate histogram;
#[macro_use]
extern crate log;
extern crate num_cpus;
extern crate rand;
extern crate rangestore;
extern crate tokio;

use bytes::Bytes;
use futures::future::join_all;
use getopts::Options;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rangestore::key::long_key;
use rangestore::storage::StoreType;
use rangestore::transport::MemoryNetwork;
use rangestore::{GetOp, KeyType, Store};
use std::env;
use std::process::exit;
use std::sync::{Arc, Mutex};
use std::time;

macro_rules! to_ms {
    ($e:expr) => {
        (($e as f32) / 1000000f32)
    };
}

struct Opts {
    ranks: u32,
    factor: u32,
    records: usize,
    batch: usize,
    bytes: usize,
}

fn parse_opts() -> Opts {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("r", "ranks", "number of ranks in the group", "N");
    opts.optopt("f", "server-factor", "every Nth rank is a range server", "N");
    opts.optopt("n", "records", "records written by each rank", "N");
    opts.optopt("k", "batch", "records per bulk request", "N");
    opts.optopt("b", "bytes", "number of bytes per value", "N");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            println!("{}", f);
            exit(1);
        }
    };

    if matches.opt_present("h") {
        let brief = format!("Usage: {} [options]", program);
        print!("{}", opts.usage(&brief));
        exit(1);
    }

    let num = |name: &str, default: usize| -> usize {
        match matches.opt_str(name) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                println!("Invalid value for -{}: {}", name, v);
                exit(1);
            }),
            None => default,
        }
    };

    Opts {
        ranks: num("r", num_cpus::get().max(2)) as u32,
        factor: num("f", 1) as u32,
        records: num("n", 100_000),
        batch: num("k", 1000).max(1),
        bytes: num("b", 100),
    }
}

#[derive(Clone)]
struct Metrics {
    state: Arc<Mutex<(u32, histogram::Histogram)>>,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics {
            state: Arc::new(Mutex::new((0, histogram::Histogram::new()))),
        }
    }

    pub fn incr(&self, records: usize, duration: time::Duration) {
        if duration.as_secs() > 0 {
            println!("WARN: {}s latency", duration.as_secs());
        }

        let nanos = duration.as_nanos() as u64;
        let mut data = self.state.lock().unwrap();
        data.0 += records as u32;
        data.1.increment(nanos).unwrap();
    }

    pub fn snapshot(&self, name: &str, elapsed: time::Duration) -> Result<(), &str> {
        let (records, p50, p95, p99, max) = {
            let mut data = self.state.lock().unwrap();
            let v = (
                data.0,
                data.1.percentile(50.0)?,
                data.1.percentile(95.0)?,
                data.1.percentile(99.0)?,
                data.1.maximum()?,
            );
            data.0 = 0;
            data.1.clear();
            v
        };
        println!(
            "{} :: AVG RECORDS/s :: {}",
            name,
            (records as f32) / elapsed.as_secs_f32()
        );
        println!(
            "{} :: BATCH LATENCY(ms) :: p50: {}, p95: {}, p99: {}, max: {}",
            name,
            to_ms!(p50),
            to_ms!(p95),
            to_ms!(p99),
            to_ms!(max)
        );
        Ok(())
    }
}

fn keys(rank: u32, opts: &Opts) -> Vec<Bytes> {
    let mut rng = SmallRng::seed_from_u64(u64::from(rank));
    let space = (opts.records as i64 * i64::from(opts.ranks)).max(1) * 10;
    (0..opts.records)
        .map(|_| long_key(rng.gen_range(0..space)))
        .collect()
}

async fn bench_puts(store: &Store, keys: &[Bytes], opts: &Opts, metrics: &Metrics) {
    let router = store.router();
    let value = Bytes::from(vec![b'x'; opts.bytes]);
    for batch in keys.chunks(opts.batch) {
        let records = batch.iter().map(|k| (k.clone(), value.clone())).collect();
        let start = time::Instant::now();
        match router.bput(store.primary(), records).await {
            Ok(receipts) => {
                if receipts.iter().any(|r| !r.error.is_success()) {
                    error!("Rank {} bulk put failed", store.rank());
                }
            }
            Err(e) => error!("Rank {} bulk put error: {}", store.rank(), e),
        }
        metrics.incr(batch.len(), start.elapsed());
    }
}

async fn bench_gets(store: &Store, keys: &[Bytes], opts: &Opts, metrics: &Metrics) {
    let router = store.router();
    for batch in keys.chunks(opts.batch) {
        let start = time::Instant::now();
        match router.bget(store.primary(), GetOp::Equal, batch.to_vec()).await {
            Ok(results) => {
                let found: usize = results.iter().map(|r| r.found().count()).sum();
                if found < batch.len() {
                    warn!(
                        "Rank {} found {} of {} records",
                        store.rank(),
                        found,
                        batch.len()
                    );
                }
            }
            Err(e) => error!("Rank {} bulk get error: {}", store.rank(), e),
        }
        metrics.incr(batch.len(), start.elapsed());
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let opts = parse_opts();
    let options = rangestore::Options {
        store_type: StoreType::Memory,
        key_type: KeyType::LongInt,
        server_factor: opts.factor,
        ..rangestore::Options::default()
    };

    let (network, ranks) = MemoryNetwork::new(opts.ranks, options.max_message_bytes);
    let mut stores = Vec::with_capacity(ranks.len());
    for (transport, inbound) in ranks {
        match Store::open(options.clone(), transport, inbound).await {
            Ok(store) => stores.push(store),
            Err(e) => {
                error!("Unable to open store: {}", e);
                exit(1);
            }
        }
    }
    println!(
        "{} ranks, {} range servers, {} records per rank",
        opts.ranks,
        stores[0].primary().topology().num_servers(),
        opts.records
    );

    let keys: Vec<Vec<Bytes>> = (0..opts.ranks).map(|rank| keys(rank, &opts)).collect();
    let metrics = Metrics::new();

    let start = time::Instant::now();
    join_all(
        stores
            .iter()
            .zip(&keys)
            .map(|(store, keys)| bench_puts(store, keys, &opts, &metrics)),
    )
    .await;
    if let Err(e) = metrics.snapshot("PUT", start.elapsed()) {
        error!("Error writing metrics: {}", e);
    }

    let start = time::Instant::now();
    join_all(
        stores
            .iter()
            .zip(&keys)
            .map(|(store, keys)| bench_gets(store, keys, &opts, &metrics)),
    )
    .await;
    if let Err(e) = metrics.snapshot("GET", start.elapsed()) {
        error!("Error writing metrics: {}", e);
    }

    let start = time::Instant::now();
    for res in join_all(stores.iter().map(|s| s.stat_flush(s.primary()))).await {
        if let Err(e) = res {
            error!("Flush failed: {}", e);
        }
    }
    println!("FLUSH :: {}ms", to_ms!(start.elapsed().as_nanos()));
    println!(
        "FRAMES :: {} requests, {} frames",
        network.requests_sent(),
        network.frames_sent()
    );

    for res in join_all(stores.into_iter().map(|s| s.close())).await {
        if let Err(e) = res {
            error!("Error closing store: {}", e);
        }
    }

    print!("{}", rangestore::metrics::render());
}
