use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

use parkd::engine::Engine;
use parkd::notify::NotifyHub;
use parkd::wire;

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dir = std::env::temp_dir().join(format!("parkd_diag_{}", Ulid::new()));
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

#[tokio::test]
async fn diag() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    client
        .simple_query("INSERT INTO lots (name, capacity, rate) VALUES ('beta', 1, 40)")
        .await
        .unwrap();
    let err = client
        .simple_query(
            r#"INSERT INTO bookings (lot, plate, date, start, "end") VALUES ('beta', 'P-1', '2030-06-01', '10:00', '09:00')"#,
        )
        .await
        .unwrap_err();
    eprintln!("DISPLAY=[{err}]");
    eprintln!("DEBUG=[{err:?}]");
    if let Some(db) = err.as_db_error() {
        eprintln!("DBERROR_MESSAGE=[{}]", db.message());
    } else {
        eprintln!("NO_DB_ERROR source={:?}", std::error::Error::source(&err));
    }
}
