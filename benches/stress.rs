use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;

async fn connect(host: &str, port: u16, db: &str, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user(user)
        .password("rentd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A fresh marketplace with one owner, one item, and one renter session.
struct Market {
    db: String,
    owner_id: Ulid,
    renter_id: Ulid,
    item: Ulid,
}

async fn open_market(host: &str, port: u16) -> Market {
    let db = format!("bench_{}", Ulid::new());
    let (owner_id, renter_id, item) = (Ulid::new(), Ulid::new(), Ulid::new());

    let registrar = connect(host, port, &db, "registrar").await;
    for (id, name) in [(owner_id, "owner"), (renter_id, "renter")] {
        registrar
            .batch_execute(&format!("INSERT INTO users (id, name) VALUES ('{id}', '{name}')"))
            .await
            .unwrap();
    }
    let owner = connect(host, port, &db, &owner_id.to_string()).await;
    owner
        .batch_execute(&format!("INSERT INTO items (id, name) VALUES ('{item}', 'bench item')"))
        .await
        .unwrap();

    Market {
        db,
        owner_id,
        renter_id,
        item,
    }
}

/// Create a booking and return its id.
async fn book(client: &Client, item: Ulid, start: i64) -> Option<String> {
    let sql = format!(
        r#"INSERT INTO bookings (item_id, start, "end") VALUES ('{item}', {start}, {})"#,
        start + HOUR
    );
    client
        .simple_query(&sql)
        .await
        .ok()?
        .into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
            _ => None,
        })
}

async fn phase1_sequential(host: &str, port: u16) {
    let market = open_market(host, port).await;
    let client = connect(host, port, &market.db, &market.renter_id.to_string()).await;
    let base = now_ms();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        book(&client, market.item, base + (i as i64) * HOUR)
            .await
            .expect("booking failed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let market = open_market(&host, port).await;
            let client = connect(&host, port, &market.db, &market.renter_id.to_string()).await;
            let base = now_ms();
            for j in 0..n_per_task {
                book(&client, market.item, base + (j as i64) * HOUR)
                    .await
                    .expect("booking failed");
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_listing_under_load(host: &str, port: u16) {
    let market = open_market(host, port).await;
    let renter = connect(host, port, &market.db, &market.renter_id.to_string()).await;
    let base = now_ms() - 100 * DAY;
    for i in 0..500 {
        book(&renter, market.item, base + (i as i64) * 6 * HOUR).await;
    }
    drop(renter);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let db = market.db.clone();
        let renter_id = market.renter_id;
        let item = market.item;
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &renter_id.to_string()).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                book(&client, item, now_ms() + (w * 100_000 + i) * HOUR).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let db = market.db.clone();
        let (user, table) = if r % 2 == 0 {
            (market.renter_id, "bookings")
        } else {
            (market.owner_id, "owner_bookings")
        };
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &user.to_string()).await;
            let states = ["ALL", "PAST", "FUTURE", "CURRENT", "WAITING"];
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let sql = format!(
                    r#"SELECT * FROM {table} WHERE state = '{}' AND "from" = {} AND size = 20"#,
                    states[i % states.len()],
                    (i % 10) * 20
                );
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("listing query", &mut all_latencies);
}

async fn phase4_approval_contention(host: &str, port: u16) {
    let market = open_market(host, port).await;
    let renter = connect(host, port, &market.db, &market.renter_id.to_string()).await;
    let base = now_ms() + DAY;

    let n_bookings = 200;
    let n_approvers = 4;
    let mut ids = Vec::with_capacity(n_bookings);
    for i in 0..n_bookings {
        if let Some(id) = book(&renter, market.item, base + (i as i64) * HOUR).await {
            ids.push(id);
        }
    }
    let ids = Arc::new(ids);

    let wins = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_approvers {
        let host = host.to_string();
        let db = market.db.clone();
        let owner_id = market.owner_id;
        let ids = ids.clone();
        let wins = wins.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &owner_id.to_string()).await;
            for id in ids.iter() {
                let sql = format!("INSERT INTO approvals (booking_id, approved) VALUES ('{id}', true)");
                if client.simple_query(&sql).await.is_ok() {
                    wins.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let won = wins.load(Ordering::Relaxed);
    println!(
        "  {n_approvers} approvers x {} bookings: {won} approvals won in {:.2}s (expected {})",
        ids.len(),
        elapsed.as_secs_f64(),
        ids.len()
    );
}

async fn phase5_connection_storm(host: &str, port: u16) {
    let market = open_market(host, port).await;
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for c in 0..n_conns {
        let host = host.to_string();
        let db = market.db.clone();
        let renter_id = market.renter_id;
        let item = market.item;
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db, &renter_id.to_string()).await;
            let base = now_ms() + (c as i64) * 1000 * HOUR;
            for i in 0..ops_per_conn {
                book(&client, item, base + (i as i64) * HOUR)
                    .await
                    .expect("booking failed");
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("RENTD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RENTD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid RENTD_PORT");

    println!("=== rentd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase opens its own marketplace (unique database name).

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] listing latency under write load");
    phase3_listing_under_load(&host, port).await;

    println!("\n[phase 4] approval contention");
    phase4_approval_contention(&host, port).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
