#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use strata::{
    BlockStore, DirId, DirStats, IdentityKind, MemBlockStore, Owner, Pool, PoolConfig, PoolStats,
    ReserveRequest, StrataError,
};

const KIB: u64 = 1024;
const DEFAULT_CAPACITY: u64 = 64 << 20;

#[derive(Debug, Serialize)]
struct SimulateOutput {
    pool: PoolStats,
    directories: Vec<DirStats>,
    /// Per-identity usage of the `home/alice` dataset, keyed by kind.
    identities: BTreeMap<&'static str, BTreeMap<String, i64>>,
    /// Outcome of a request that overruns `home/alice`'s quota.
    over_quota: AdmissionOutcome,
}

#[derive(Debug, Serialize)]
struct AdmissionOutcome {
    requested: u64,
    admitted: bool,
    error: Option<String>,
    errno: Option<i32>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "simulate" => {
            let mut json = false;
            let mut config_path = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--json" => json = true,
                    "--config" => {
                        let Some(path) = args.next() else {
                            bail!("--config requires a path argument");
                        };
                        config_path = Some(path);
                    }
                    other => bail!("unknown simulate option: {other}"),
                }
            }
            let config = match config_path {
                Some(path) => load_config(Path::new(&path))?,
                None => PoolConfig {
                    min_slop_bytes: 0,
                    ..PoolConfig::with_capacity(DEFAULT_CAPACITY)
                },
            };
            simulate(config, json)
        }
        "config" => {
            let config = PoolConfig::with_capacity(DEFAULT_CAPACITY);
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("serialize config")?
            );
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("strata\n");
    println!("USAGE:");
    println!("  strata simulate [--config <config.json>] [--json]");
    println!("  strata config");
}

fn load_config(path: &Path) -> Result<PoolConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pool config: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid pool config: {}", path.display()))
}

/// Build a small directory tree in memory, push writes from several
/// identities through it, and report what the accounting says.
fn simulate(config: PoolConfig, json: bool) -> Result<()> {
    let capacity = config.capacity_bytes;
    let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new(capacity.saturating_mul(2)));
    let pool = Pool::create(config, store).context("failed to create pool")?;

    let root = pool.root_id();
    let home = pool.create_directory(root, "home").context("create home")?;
    let alice = pool.create_directory(home, "alice").context("create alice")?;
    let bob = pool.create_directory(home, "bob").context("create bob")?;
    pool.set_quota(home, 1024 * KIB).context("quota on home")?;
    pool.set_quota(alice, 256 * KIB).context("quota on alice")?;
    pool.set_reservation(bob, 128 * KIB).context("reservation on bob")?;
    pool.set_filesystem_limit(home, Some(8)).context("filesystem limit on home")?;

    let handle = pool.hold_objset(alice).context("hold alice")?;
    for round in 0..4_u64 {
        let mut tx = pool.begin_tx(&handle)?;
        tx.assign_wait(32 * KIB, 40 * KIB, false)
            .with_context(|| format!("assign round {round}"))?;
        for i in 0..4_u64 {
            let id = tx.create_object(Owner::new(1000 + i, 100 + i % 2))?;
            tx.write(id, &[0x5a; 8192])?;
        }
        tx.commit();
        pool.sync_generation().with_context(|| format!("sync round {round}"))?;
    }

    let over_quota = try_admit(&pool, alice, 256 * KIB);

    let mut identities = BTreeMap::new();
    for (label, kind) in [
        ("user", IdentityKind::User),
        ("group", IdentityKind::Group),
        ("project", IdentityKind::Project),
    ] {
        identities.insert(label, handle.accounting_entries(kind));
    }
    drop(handle);
    pool.sync_generation().context("final sync")?;

    let mut directories = Vec::new();
    for dir in [root, home, alice, bob] {
        directories.push(pool.stats(dir)?);
    }
    let output = SimulateOutput {
        pool: pool.pool_stats(),
        directories,
        identities,
        over_quota,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        print_report(&output);
    }
    Ok(())
}

fn try_admit(pool: &Pool, dir: DirId, physical: u64) -> AdmissionOutcome {
    let req = ReserveRequest {
        physical,
        ..ReserveRequest::default()
    };
    match pool.reserve(dir, req) {
        Ok(ticket) => {
            pool.cancel(&ticket);
            AdmissionOutcome {
                requested: physical,
                admitted: true,
                error: None,
                errno: None,
            }
        }
        Err(err) => AdmissionOutcome {
            requested: physical,
            admitted: false,
            errno: Some(err.to_errno()),
            error: Some(describe(&err)),
        },
    }
}

fn describe(err: &StrataError) -> String {
    if err.is_retryable() {
        format!("{err} (retry after the open generation syncs)")
    } else {
        err.to_string()
    }
}

fn print_report(output: &SimulateOutput) {
    let pool = &output.pool;
    println!("Strata Simulation");
    println!("pool: {}", pool.name);
    println!("capacity: {}", pool.capacity);
    println!("slop: {}", pool.slop);
    println!("synced_txg: {}", pool.synced_txg);
    println!("deferred: {}", pool.deferred);
    println!();
    println!(
        "{:<20} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "DIRECTORY", "USED", "AVAIL", "QUOTA", "RESERV", "REFER"
    );
    for dir in &output.directories {
        println!(
            "{:<20} {:>10} {:>10} {:>10} {:>10} {:>10}",
            dir.name, dir.used, dir.available, dir.quota, dir.reservation, dir.referenced
        );
    }
    println!();
    for (kind, entries) in &output.identities {
        for (key, bytes) in entries {
            println!("{kind}:{key} {bytes}");
        }
    }
    println!();
    let outcome = &output.over_quota;
    match &outcome.error {
        None => println!("over-quota request of {} bytes: admitted", outcome.requested),
        Some(error) => println!(
            "over-quota request of {} bytes: denied ({error}, errno {})",
            outcome.requested,
            outcome.errno.unwrap_or_default()
        ),
    }
}
