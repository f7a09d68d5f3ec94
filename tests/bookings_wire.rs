use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use rentd::engine::TransitionPolicy;
use rentd::model::DAY_MS;
use rentd::tenant::TenantManager;
use rentd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rentd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, TransitionPolicy::Revocable));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "rentd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(addr: SocketAddr, db: &str, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user(user)
        .password("rentd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// Registers an owner with one item and a renter, and returns their sessions.
struct Marketplace {
    owner: Client,
    renter: Client,
    stranger: Client,
    item: Ulid,
}

async fn marketplace(addr: SocketAddr, db: &str) -> Marketplace {
    let (owner_id, renter_id, stranger_id) = (Ulid::new(), Ulid::new(), Ulid::new());
    let registrar = connect(addr, db, "registrar").await;
    for (id, name) in [(owner_id, "olga"), (renter_id, "rafa"), (stranger_id, "sam")] {
        registrar
            .batch_execute(&format!(
                "INSERT INTO users (id, name, email) VALUES ('{id}', '{name}', '{name}@example.com')"
            ))
            .await
            .unwrap();
    }

    let owner = connect(addr, db, &owner_id.to_string()).await;
    let item = Ulid::new();
    owner
        .batch_execute(&format!(
            "INSERT INTO items (id, name, description) VALUES ('{item}', 'cargo bike', 'electric')"
        ))
        .await
        .unwrap();

    Marketplace {
        owner,
        renter: connect(addr, db, &renter_id.to_string()).await,
        stranger: connect(addr, db, &stranger_id.to_string()).await,
        item,
    }
}

fn book_sql(item: Ulid, start: i64, end: i64) -> String {
    format!(r#"INSERT INTO bookings (item_id, start, "end") VALUES ('{item}', {start}, {end})"#)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle() {
    let (addr, _tm) = start_test_server().await;
    let m = marketplace(addr, "lifecycle").await;
    let now = now_ms();

    let created = query(&m.renter, &book_sql(m.item, now + DAY_MS, now + 2 * DAY_MS)).await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("status"), Some("WAITING"));
    assert_eq!(created[0].get("item_id"), Some(m.item.to_string().as_str()));
    let booking_id = created[0].get("id").unwrap().to_string();

    let approved = query(
        &m.owner,
        &format!("INSERT INTO approvals (booking_id, approved) VALUES ('{booking_id}', true)"),
    )
    .await;
    assert_eq!(approved[0].get("status"), Some("APPROVED"));

    let again = format!("INSERT INTO approvals VALUES ('{booking_id}', true)");
    assert_eq!(sqlstate(&m.owner, &again).await, "55000");
    assert_eq!(sqlstate(&m.stranger, &again).await, "42501");

    let fetched = query(
        &m.renter,
        &format!("SELECT * FROM bookings WHERE id = '{booking_id}'"),
    )
    .await;
    assert_eq!(fetched[0].get("status"), Some("APPROVED"));
    let hidden = format!("SELECT * FROM bookings WHERE id = '{booking_id}'");
    assert_eq!(sqlstate(&m.stranger, &hidden).await, "42501");

    let mine = query(&m.renter, "SELECT * FROM bookings WHERE state = 'future'").await;
    assert_eq!(mine.len(), 1);
    let owned = query(&m.owner, "SELECT * FROM owner_bookings WHERE state = 'FUTURE'").await;
    assert_eq!(owned.len(), 1);
    assert!(query(&m.owner, "SELECT * FROM bookings").await.is_empty());

    let delete = format!("DELETE FROM bookings WHERE id = '{booking_id}'");
    assert_eq!(sqlstate(&m.owner, &delete).await, "42501");
    let deleted = query(&m.renter, &delete).await;
    assert_eq!(deleted[0].get("id"), Some(booking_id.as_str()));
    assert_eq!(sqlstate(&m.renter, &delete).await, "P0002");
}

#[tokio::test]
async fn creation_errors_map_to_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let m = marketplace(addr, "creation_errors").await;
    let now = now_ms();

    assert_eq!(
        sqlstate(&m.renter, &book_sql(m.item, now + DAY_MS, now)).await,
        "22023"
    );
    assert_eq!(
        sqlstate(&m.owner, &book_sql(m.item, now + DAY_MS, now + 2 * DAY_MS)).await,
        "42501"
    );
    assert_eq!(
        sqlstate(&m.renter, &book_sql(Ulid::new(), now + DAY_MS, now + 2 * DAY_MS)).await,
        "P0002"
    );
    assert!(query(&m.renter, "SELECT * FROM bookings").await.is_empty());
}

#[tokio::test]
async fn listing_pages_and_states() {
    let (addr, _tm) = start_test_server().await;
    let m = marketplace(addr, "listing").await;
    let now = now_ms();

    for i in 1..=5 {
        m.renter
            .simple_query(&book_sql(m.item, now + i * DAY_MS, now + (i + 1) * DAY_MS))
            .await
            .unwrap();
    }

    let first = query(&m.renter, r#"SELECT * FROM bookings WHERE "from" = 0 AND size = 2"#).await;
    let second = query(&m.renter, r#"SELECT * FROM bookings WHERE "from" = 2 AND size = 2"#).await;
    let both = query(&m.renter, r#"SELECT * FROM bookings WHERE "from" = 0 AND size = 4"#).await;
    let ids = |rows: &[SimpleQueryRow]| -> Vec<String> {
        rows.iter().map(|r| r.get("id").unwrap().to_string()).collect()
    };
    let mut joined = ids(&first);
    joined.extend(ids(&second));
    assert_eq!(joined, ids(&both));

    let ends: Vec<i64> = both
        .iter()
        .map(|r| r.get("end").unwrap().parse().unwrap())
        .collect();
    assert!(ends.windows(2).all(|w| w[0] >= w[1]));

    assert_eq!(query(&m.renter, "SELECT * FROM bookings WHERE state = 'Waiting'").await.len(), 5);
    assert!(query(&m.renter, "SELECT * FROM bookings WHERE state = 'past'").await.is_empty());
    assert_eq!(
        sqlstate(&m.renter, "SELECT * FROM bookings WHERE state = 'BOGUS'").await,
        "22023"
    );
    assert_eq!(
        sqlstate(&m.renter, r#"SELECT * FROM bookings WHERE "from" = -1"#).await,
        "22023"
    );
}

#[tokio::test]
async fn comments_after_rental() {
    let (addr, _tm) = start_test_server().await;
    let m = marketplace(addr, "comments").await;
    let now = now_ms();

    let comment = format!(
        "INSERT INTO comments (item_id, text) VALUES ('{}', 'smooth ride')",
        m.item
    );
    assert_eq!(sqlstate(&m.owner, &comment).await, "P0001");
    assert_eq!(sqlstate(&m.renter, &comment).await, "P0001");

    m.renter
        .simple_query(&book_sql(m.item, now - 2 * DAY_MS, now - DAY_MS))
        .await
        .unwrap();
    let added = query(&m.renter, &comment).await;
    assert_eq!(added[0].get("text"), Some("smooth ride"));

    let listed = query(
        &m.stranger,
        &format!("SELECT * FROM comments WHERE item_id = '{}'", m.item),
    )
    .await;
    assert_eq!(listed.len(), 1);

    let view = query(&m.owner, &format!("SELECT * FROM items WHERE id = '{}'", m.item)).await;
    assert_eq!(view[0].get("name"), Some("cargo bike"));
    assert_eq!(view[0].get("comment_count"), Some("1"));
    assert!(view[0].get("last_booking_id").is_some());
    assert_eq!(view[0].get("next_booking_id"), None);

    let view = query(&m.renter, &format!("SELECT * FROM items WHERE id = '{}'", m.item)).await;
    assert_eq!(view[0].get("last_booking_id"), None);
}

#[tokio::test]
async fn sessions_and_parse_errors() {
    let (addr, _tm) = start_test_server().await;
    let m = marketplace(addr, "sessions").await;
    let now = now_ms();

    let anonymous = connect(addr, "sessions", "not-a-ulid").await;
    assert_eq!(
        sqlstate(&anonymous, &book_sql(m.item, now + DAY_MS, now + 2 * DAY_MS)).await,
        "28000"
    );
    assert_eq!(sqlstate(&m.renter, "SELEKT 1").await, "42601");
    assert_eq!(sqlstate(&m.renter, "SELECT * FROM resources").await, "42601");

    // Marketplaces are separate databases.
    let other = connect(addr, "elsewhere", "registrar").await;
    let view = format!("SELECT * FROM comments WHERE item_id = '{}'", m.item);
    assert_eq!(sqlstate(&other, &view).await, "P0002");
}

#[tokio::test]
async fn extended_protocol_binds_each_parameter_once() {
    let (addr, _tm) = start_test_server().await;
    let m = marketplace(addr, "extended").await;
    let now = now_ms();
    m.renter
        .simple_query(&book_sql(m.item, now - 2 * DAY_MS, now - DAY_MS))
        .await
        .unwrap();

    let item = m.item.to_string();
    let text = "costs $1 per day, isn't bad";
    let added = m
        .renter
        .query(
            "INSERT INTO comments (item_id, text) VALUES ($1, $2)",
            &[&item, &text],
        )
        .await
        .unwrap();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].get::<_, String>("text"), text);
    assert_eq!(added[0].get::<_, String>("item_id"), item);

    let listed = m
        .stranger
        .query("SELECT * FROM comments WHERE item_id = $1", &[&item])
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get::<_, String>("text"), text);
}

#[tokio::test]
async fn owner_lists_their_items() {
    let (addr, _tm) = start_test_server().await;
    let m = marketplace(addr, "owned_items").await;
    let now = now_ms();

    let second = Ulid::new();
    m.owner
        .batch_execute(&format!(
            "INSERT INTO items (id, name, available) VALUES ('{second}', 'tent', 0)"
        ))
        .await
        .unwrap();
    let next = query(&m.renter, &book_sql(m.item, now + DAY_MS, now + 2 * DAY_MS)).await;

    let owned = query(&m.owner, "SELECT * FROM items").await;
    assert_eq!(owned.len(), 2);
    let bike = owned
        .iter()
        .find(|r| r.get("id") == Some(m.item.to_string().as_str()))
        .unwrap();
    assert_eq!(bike.get("next_booking_id"), next[0].get("id"));
    let tent = owned
        .iter()
        .find(|r| r.get("id") == Some(second.to_string().as_str()))
        .unwrap();
    assert_eq!(tent.get("next_booking_id"), None);
    assert_ne!(tent.get("available"), bike.get("available"));

    let page = query(&m.owner, r#"SELECT * FROM items WHERE "from" = 1 AND size = 1"#).await;
    assert_eq!(page.len(), 1);
    assert!(query(&m.renter, "SELECT * FROM items").await.is_empty());
    assert_eq!(
        sqlstate(&m.owner, "SELECT * FROM items WHERE size = 0").await,
        "22023"
    );
}
