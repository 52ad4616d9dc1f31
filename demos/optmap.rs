use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, Local};
use clap::{Parser, Subcommand};
use optmap::{Error, OptMap, OptMapBuilder, OptionSymbol, OptionType, Result, TypedMap};
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Info(args) => run_info(args),
        Command::Load(args) => run_load(args),
        Command::Concurrent(args) => run_concurrent(args),
        Command::Risk(args) => run_risk(args),
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "optmap utility for inspecting and benchmarking option symbol stores",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect a store file and print basic information
    Info(InfoArgs),
    /// Load random option symbols with prices, then update random entries
    Load(LoadArgs),
    /// Populate string entries and hammer them from several threads
    Concurrent(ConcurrentArgs),
    /// Run margin and position checks over generated FIX orders
    Risk(RiskArgs),
}

#[derive(clap::Args)]
struct InfoArgs {
    /// Path to the store file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Optional key to look up, either OCC text or raw bytes
    #[arg(short, long)]
    key: Option<String>,
}

#[derive(clap::Args)]
struct LoadArgs {
    /// Path to the store file to create
    #[arg(short, long, value_name = "FILE", default_value = "symbol_map.osym")]
    output: PathBuf,

    /// Number of random symbols to insert
    #[arg(long, default_value_t = 5_000_000)]
    symbols: u64,

    /// Number of get-then-put accesses after loading
    #[arg(long, default_value_t = 1_000_000)]
    accesses: u64,

    /// Optional override for the hash seed
    #[arg(long, value_name = "SEED", default_value_t = 0)]
    hash_seed: u64,
}

#[derive(clap::Args)]
struct ConcurrentArgs {
    /// Path to the store file to create
    #[arg(short, long, value_name = "FILE", default_value = "concurrent.osym")]
    output: PathBuf,

    #[arg(long, default_value_t = 1_000_000)]
    entries: u64,

    #[arg(long, default_value_t = 10)]
    threads: usize,

    /// Operations per thread, half gets and half puts
    #[arg(long, default_value_t = 100_000)]
    operations: u64,
}

#[derive(clap::Args)]
struct RiskArgs {
    /// Number of orders to generate
    #[arg(long, default_value_t = 1000)]
    orders: usize,

    /// Worker threads processing orders
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Orders priced above this fail the margin check
    #[arg(long, default_value_t = 1000.0)]
    max_price: f64,

    /// Simulated latency of each check in milliseconds
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,
}

fn run_info(args: InfoArgs) -> Result<()> {
    let map = OptMap::open(&args.input)?;
    println!("{}", to_json(&map.info())?);

    if let Some(key) = args.key {
        match key.parse::<OptionSymbol>() {
            Ok(symbol) => {
                let price = map.get_with(&symbol.encode_fixed(), |bytes| {
                    bytes.try_into().map(f64::from_le_bytes).ok()
                });
                println!("{}: {:?}", symbol.describe(), price.flatten());
            }
            Err(_) => {
                let value = map.get(key.as_bytes());
                println!(
                    "{key}: {:?}",
                    value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                );
            }
        }
    }
    map.close()
}

const TICKERS: [(&str, u32); 20] = [
    ("AAPL", 175),
    ("MSFT", 350),
    ("GOOGL", 140),
    ("AMZN", 130),
    ("TSLA", 250),
    ("META", 300),
    ("NVDA", 450),
    ("AMD", 110),
    ("JPM", 160),
    ("BAC", 35),
    ("INTC", 40),
    ("CSCO", 55),
    ("PFE", 30),
    ("KO", 60),
    ("DIS", 120),
    ("NFLX", 400),
    ("V", 240),
    ("WMT", 80),
    ("PG", 150),
    ("XOM", 110),
];

/// Random contract expiring within two years, struck within 40% of the
/// underlying's base price.
fn random_symbol(rng: &mut impl Rng) -> Result<OptionSymbol> {
    let (ticker, base) = TICKERS[rng.gen_range(0..TICKERS.len())];
    let option_type = if rng.r#gen() {
        OptionType::Call
    } else {
        OptionType::Put
    };
    let expiration = Local::now().date_naive() + Days::new(rng.gen_range(1..=730));

    let base = base as f64;
    let variation = base * 0.4;
    let strike = base + rng.gen_range(-variation..variation);
    let strike = if strike < 100.0 {
        (strike * 4.0).round() / 4.0
    } else {
        (strike / 5.0).round() * 5.0
    };
    OptionSymbol::with_strike(ticker, option_type, expiration, strike)
}

fn run_load(args: LoadArgs) -> Result<()> {
    let mut rng = rand::thread_rng();
    let sample = random_symbol(&mut rng)?;

    println!("Creating store with {} option symbols...", args.symbols);
    let start = Instant::now();
    let map: TypedMap<OptionSymbol, f64> = OptMapBuilder::default()
        .with_entries(args.symbols)
        .with_average_key(&sample)?
        .with_average_value(&0.0f64)?
        .with_put_returns_null(true)
        .with_hash_seed(args.hash_seed)
        .create_typed(&args.output)?;

    for i in 0..args.symbols {
        let symbol = random_symbol(&mut rng)?;
        map.put(&symbol, &rng.gen_range(100.0..1000.0))?;
        if i % 100_000 == 0 {
            info!(loaded = i, "loading symbols");
        }
    }
    let info = map.info();
    println!(
        "Loaded {} distinct symbols in {:.2} seconds",
        map.len(),
        start.elapsed().as_secs_f64()
    );
    println!(
        "Store size: {:.2} MB",
        info.file_length as f64 / (1024.0 * 1024.0)
    );

    let symbols = map.keys().collect::<Result<Vec<_>>>()?;
    if symbols.is_empty() {
        return map.close();
    }

    println!("\nPerforming {} random accesses...", args.accesses);
    let start = Instant::now();
    let mut hits = 0u64;
    for _ in 0..args.accesses {
        let symbol = &symbols[rng.gen_range(0..symbols.len())];
        // Not atomic: a concurrent writer could slip in between.
        let price = map.get(symbol)?;
        if let Some(price) = price {
            map.put(symbol, &(price + 1.0))?;
            hits += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "Random access test completed in {:.2} seconds",
        elapsed.as_secs_f64()
    );
    println!(
        "Average access time: {:.2} microseconds per operation",
        elapsed.as_secs_f64() * 1e6 / args.accesses as f64
    );
    println!(
        "Operations per second: {:.2}",
        args.accesses as f64 / elapsed.as_secs_f64()
    );
    println!(
        "Hit rate: {:.2}%",
        hits as f64 * 100.0 / args.accesses as f64
    );

    map.close()?;
    println!("\nTest completed and store closed.");
    Ok(())
}

fn run_concurrent(args: ConcurrentArgs) -> Result<()> {
    let map: TypedMap<String, String> = OptMapBuilder::default()
        .with_entries(args.entries)
        .with_average_key(&"SYM000001".to_string())?
        .with_average_value(&"VALUE000001".to_string())?
        .create_typed(&args.output)?;

    println!("Populating store...");
    let start = Instant::now();
    for i in 0..args.entries {
        map.put(&format!("SYM{i}"), &format!("VALUE{i}"))?;
    }
    println!("Population time: {} ms", start.elapsed().as_millis());

    println!("Starting concurrent access test...");
    let failures = AtomicU64::new(0);
    let start = Instant::now();
    std::thread::scope(|scope| {
        for thread in 0..args.threads {
            let map = &map;
            let failures = &failures;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..args.operations {
                    let key = format!("SYM{}", rng.gen_range(0..args.entries));
                    let result = if rng.r#gen() {
                        map.get(&key).map(drop)
                    } else {
                        map.put(&key, &format!("VALUE-{thread}")).map(drop)
                    };
                    if let Err(err) = result {
                        warn!(thread, %key, %err, "operation failed");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    let elapsed = start.elapsed();
    let total = args.threads as u64 * args.operations;
    println!(
        "{total} operations in {} ms ({:.0} ops/s), {} failures",
        elapsed.as_millis(),
        total as f64 / elapsed.as_secs_f64(),
        failures.load(Ordering::Relaxed)
    );
    println!("Final size: {} (expected {})", map.len(), args.entries);
    map.close()
}

/// A parsed `35=D` new-order message.
struct Order {
    symbol: String,
    price: f64,
}

impl Order {
    fn parse(message: &str) -> Option<Self> {
        let mut symbol = None;
        let mut price = None;
        for field in message.split('|') {
            match field.split_once('=') {
                Some(("55", value)) => symbol = Some(value.to_string()),
                Some(("44", value)) => price = value.parse().ok(),
                _ => {}
            }
        }
        Some(Order {
            symbol: symbol?,
            price: price?,
        })
    }
}

fn generate_fix_messages(count: usize, rng: &mut impl Rng) -> Vec<String> {
    const SYMBOLS: [&str; 5] = ["AAPL", "GOOG", "MSFT", "TSLA", "AMZN"];
    (0..count)
        .map(|_| {
            format!(
                "8=FIX.4.2|35=D|55={}|44={:.2}|10={:03}",
                SYMBOLS[rng.gen_range(0..SYMBOLS.len())],
                100.0 + rng.r#gen::<f64>() * 1000.0,
                rng.gen_range(100..1000)
            )
        })
        .collect()
}

/// Sleeps for `latency` in short steps, giving up early once `cancelled`.
fn simulated_latency(latency: Duration, cancelled: &AtomicBool) -> bool {
    let deadline = Instant::now() + latency;
    while Instant::now() < deadline {
        if cancelled.load(Ordering::Relaxed) {
            return false;
        }
        std::thread::sleep(Duration::from_micros(100).min(latency));
    }
    true
}

/// Runs the margin and position checks side by side; the first failure
/// cancels the other check.
fn check_order(order: &Order, args: &RiskArgs) -> bool {
    let latency = Duration::from_millis(args.latency_ms);
    let cancelled = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let margin = scope.spawn(|| {
            let ok = simulated_latency(latency, &cancelled) && order.price <= args.max_price;
            if !ok {
                cancelled.store(true, Ordering::Relaxed);
            }
            ok
        });
        let position = scope.spawn(|| {
            let ok = simulated_latency(latency, &cancelled) && !order.symbol.is_empty();
            if !ok {
                cancelled.store(true, Ordering::Relaxed);
            }
            ok
        });
        let margin = margin.join().unwrap_or(false);
        let position = position.join().unwrap_or(false);
        margin && position
    })
}

fn run_risk(args: RiskArgs) -> Result<()> {
    if args.workers == 0 {
        return Err(Error::InvalidArgument("workers must be positive".to_string()));
    }
    let messages = generate_fix_messages(args.orders, &mut rand::thread_rng());
    let accepted = AtomicU64::new(0);
    let rejected = AtomicU64::new(0);
    let start = Instant::now();

    let chunk = messages.len().div_ceil(args.workers).max(1);
    std::thread::scope(|scope| {
        for batch in messages.chunks(chunk) {
            let (args, accepted, rejected) = (&args, &accepted, &rejected);
            scope.spawn(move || {
                for message in batch {
                    let passed = Order::parse(message).is_some_and(|order| check_order(&order, args));
                    if passed {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    } else {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    println!(
        "Processed {} orders in {} ms: {} accepted, {} rejected",
        messages.len(),
        start.elapsed().as_millis(),
        accepted.load(Ordering::Relaxed),
        rejected.load(Ordering::Relaxed)
    );
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to format JSON: {e}"))))
}
