use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use parkd::engine::Engine;
use parkd::notify::NotifyHub;
use parkd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("parkd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(dir.join("parkd.wal"), notify).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let eng = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, eng, "parkd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("parkd")
        .user("parkd")
        .password("parkd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Collect the data rows out of a simple-query response.
fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn end_to_end_booking_flow() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('Alpha Garage', 2, 40)")
        .await
        .unwrap();

    // First booking lands on slot 1.
    let booked = rows(
        client
            .simple_query(
                r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha garage', 'KA-01-1234', '2030-06-01', '09:00', '10:00')"#,
            )
            .await
            .unwrap(),
    );
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("slot"), Some("1"));
    let booking_id = booked[0].get("booking_id").unwrap().to_string();
    assert!(!booking_id.is_empty());

    // Same interval again: fast path hands out slot 2.
    let booked = rows(
        client
            .simple_query(
                r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha garage', 'KA-02-5678', '2030-06-01', '09:00', '10:00')"#,
            )
            .await
            .unwrap(),
    );
    assert_eq!(booked[0].get("slot"), Some("2"));

    // Overlapping request with both slots taken is turned away.
    let err = client
        .simple_query(
            r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha garage', 'KA-03-0000', '2030-06-01', '09:30', '09:45')"#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no slot available"), "{err}");

    // Touching interval reuses slot 1.
    let booked = rows(
        client
            .simple_query(
                r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('alpha garage', 'KA-04-1111', '2030-06-01', '10:00', '10:15')"#,
            )
            .await
            .unwrap(),
    );
    assert_eq!(booked[0].get("slot"), Some("1"));

    // Slot listing shows both slots occupied.
    let slots = rows(
        client
            .simple_query("SELECT * FROM slots WHERE lot = 'alpha garage'")
            .await
            .unwrap(),
    );
    assert_eq!(slots.len(), 2);
    assert!(slots.iter().all(|r| r.get("status") == Some("occupied")));
}

#[tokio::test]
async fn validation_errors_surface_to_the_client() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('beta', 1, 40)")
        .await
        .unwrap();

    // Backwards interval.
    let err = client
        .simple_query(
            r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('beta', 'P-1', '2030-06-01', '10:00', '09:00')"#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("non-positive interval"), "{err}");

    // Unknown lot.
    let err = client
        .simple_query(
            r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('nowhere', 'P-1', '2030-06-01', '09:00', '10:00')"#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown lot"), "{err}");

    // Unparseable date is a wire-level error.
    let err = client
        .simple_query(
            r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('beta', 'P-1', 'June 1st', '09:00', '10:00')"#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("bad date"), "{err}");
}

#[tokio::test]
async fn owner_override_and_relisting() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('gamma', 1, 40)")
        .await
        .unwrap();
    client
        .simple_query(
            r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('gamma', 'P-1', '2030-06-01', '09:00', '17:00')"#,
        )
        .await
        .unwrap();

    let slots = rows(
        client
            .simple_query("SELECT * FROM slots WHERE lot = 'gamma'")
            .await
            .unwrap(),
    );
    assert_eq!(slots[0].get("status"), Some("occupied"));

    client
        .simple_query("UPDATE slots SET status = 'free' WHERE lot = 'gamma' AND slot = 1")
        .await
        .unwrap();

    let slots = rows(
        client
            .simple_query("SELECT * FROM slots WHERE lot = 'gamma'")
            .await
            .unwrap(),
    );
    assert_eq!(slots[0].get("status"), Some("free"));
}

#[tokio::test]
async fn requester_ticket_view_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('delta', 3, 40)")
        .await
        .unwrap();

    for (start, end) in [("09:00", "10:00"), ("13:00", "14:00")] {
        client
            .simple_query(&format!(
                r#"INSERT INTO bookings (lot, plate, date, start, "end", driver, phone, owner_name, owner_phone, account)
                   VALUES ('delta', 'P-1', '2030-06-01', '{start}', '{end}', NULL, NULL, NULL, NULL, 'asha@example.com')"#
            ))
            .await
            .unwrap();
    }

    let tickets = rows(
        client
            .simple_query("SELECT * FROM bookings WHERE account = 'asha@example.com'")
            .await
            .unwrap(),
    );
    assert_eq!(tickets.len(), 2);
    // Newest start first.
    let first_start: i64 = tickets[0].get("start").unwrap().parse().unwrap();
    let second_start: i64 = tickets[1].get("start").unwrap().parse().unwrap();
    assert!(first_start > second_start);
    assert_eq!(tickets[0].get("plate"), Some("P-1"));
}

#[tokio::test]
async fn availability_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('epsilon', 1, 40)")
        .await
        .unwrap();
    client
        .simple_query(
            r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('epsilon', 'P-1', '2030-06-01', '10:00', '11:00')"#,
        )
        .await
        .unwrap();

    let windows = rows(
        client
            .simple_query(
                "SELECT * FROM availability WHERE lot = 'epsilon' AND date = '2030-06-01'",
            )
            .await
            .unwrap(),
    );
    // The booked hour splits the day into two free windows.
    assert_eq!(windows.len(), 2);
    let first_end: i64 = windows[0].get("end").unwrap().parse().unwrap();
    let second_start: i64 = windows[1].get("start").unwrap().parse().unwrap();
    assert_eq!(second_start - first_end, 3_600_000);
}

#[tokio::test]
async fn listing_lots_and_listen_ack() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('Zeta Park', 4, 55)")
        .await
        .unwrap();

    let lots = rows(client.simple_query("SELECT * FROM lots").await.unwrap());
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].get("lot"), Some("zeta_park"));
    assert_eq!(lots[0].get("capacity"), Some("4"));
    assert_eq!(lots[0].get("rate"), Some("55"));

    client.simple_query("LISTEN lot_zeta_park").await.unwrap();

    let err = client.simple_query("LISTEN lot_unknown").await.unwrap_err();
    assert!(err.to_string().contains("unknown lot"), "{err}");
}

#[tokio::test]
async fn concurrent_clients_never_double_book() {
    let addr = start_test_server().await;

    let setup = connect(addr).await;
    setup
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('storm', 3, 40)")
        .await
        .unwrap();
    drop(setup);

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .simple_query(&format!(
                    r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('storm', 'P-{i}', '2030-06-01', '09:00', '10:00')"#
                ))
                .await
        }));
    }

    let mut granted = Vec::new();
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(messages) => {
                let r = rows(messages);
                granted.push(r[0].get("slot").unwrap().to_string());
            }
            Err(e) => {
                assert!(e.to_string().contains("no slot available"), "{e}");
                rejected += 1;
            }
        }
    }

    granted.sort();
    assert_eq!(granted, vec!["1", "2", "3"]);
    assert_eq!(rejected, 7);
}
