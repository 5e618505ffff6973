use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use curlbook::engine::Engine;
use curlbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("curlbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::open(dir.join("curlbook.wal")).unwrap());

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "curlbook".to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("curlbook")
        .user("curlbook")
        .password("curlbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// A sheet open 06:00-23:00 on Mondays and Tuesdays.
async fn sheet(client: &Client, name: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO areas (id, name, base_price, active) VALUES ('{id}', '{name}', 9000, true)"
        ))
        .await
        .unwrap();
    for day in ["mon", "tue"] {
        client
            .batch_execute(&format!(
                "INSERT INTO availabilities (id, area_id, day_of_week, date, start_time, end_time, is_available) \
                 VALUES ('{}', '{id}', '{day}', NULL, '06:00', '23:00', true)",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    id
}

fn booking_sql(id: Ulid, area: Ulid, date: &str, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO bookings (id, user_id, date, start_time, end_time, event_type, payment_status, area_ids) \
         VALUES ('{id}', '{}', '{date}', '{start}', '{end}', 'league', 'pending', '{area}')",
        Ulid::new()
    )
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_areas() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = sheet(&client, "Sheet A").await;
    let listed = rows(&client, "SELECT * FROM areas").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(listed[0].get("name"), Some("Sheet A"));
    assert_eq!(listed[0].get("base_price"), Some("9000"));

    let windows = rows(&client, &format!("SELECT * FROM availabilities WHERE area_id = '{id}'")).await;
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].get("day_of_week"), Some("Mon"));
    assert_eq!(windows[0].get("date"), None);
}

#[tokio::test]
async fn booking_conflict_is_a_user_error() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let area = sheet(&client, "Sheet A").await;

    client
        .batch_execute(&booking_sql(Ulid::new(), area, "2024-04-01", "18:00", "20:00"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&booking_sql(Ulid::new(), area, "2024-04-01", "19:00", "21:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0001"));

    // 2024-04-03 is a Wednesday: the sheet is closed.
    let err = client
        .batch_execute(&booking_sql(Ulid::new(), area, "2024-04-03", "18:00", "20:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0001"));

    let booked = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE area_id = '{area}' AND date >= '2024-04-01' AND date <= '2024-04-07'"),
    )
    .await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("start_time"), Some("18:00"));
    assert_eq!(booked[0].get("price"), Some("9000"));
}

#[tokio::test]
async fn reinserting_a_booking_edits_it() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;
    let area = sheet(&client, "Sheet A").await;
    let id = Ulid::new();

    client
        .batch_execute(&booking_sql(id, area, "2024-04-01", "18:00", "20:00"))
        .await
        .unwrap();
    // Same slot, longer: overlaps only itself.
    client
        .batch_execute(&booking_sql(id, area, "2024-04-01", "18:00", "21:00"))
        .await
        .unwrap();

    let booking = engine.get_booking(id).unwrap();
    assert_eq!(booking.range.end.format("%H:%M").to_string(), "21:00");
}

#[tokio::test]
async fn bookable_reports_verdict_and_reason() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let area = sheet(&client, "Sheet A").await;
    let existing = Ulid::new();
    client
        .batch_execute(&booking_sql(existing, area, "2024-04-01", "18:00", "20:00"))
        .await
        .unwrap();

    let free = rows(
        &client,
        &format!(
            "SELECT * FROM bookable WHERE area_ids = '{area}' AND date = '2024-04-01' \
             AND start_time = '20:00' AND end_time = '22:00'"
        ),
    )
    .await;
    assert_eq!(free[0].get("bookable"), Some("t"));
    assert_eq!(free[0].get("reason"), None);

    let taken = rows(
        &client,
        &format!(
            "SELECT * FROM bookable WHERE area_ids = '{area}' AND date = '2024-04-01' \
             AND start_time = '19:00' AND end_time = '20:00'"
        ),
    )
    .await;
    assert_eq!(taken[0].get("bookable"), Some("f"));
    assert!(taken[0].get("reason").unwrap().contains(&existing.to_string()));

    let excluded = rows(
        &client,
        &format!(
            "SELECT * FROM bookable WHERE area_ids = '{area}' AND date = '2024-04-01' \
             AND start_time = '19:00' AND end_time = '20:00' AND exclude_id = '{existing}'"
        ),
    )
    .await;
    assert_eq!(excluded[0].get("bookable"), Some("t"));
}

#[tokio::test]
async fn recurring_pattern_round_trip() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let area = sheet(&client, "Sheet A").await;
    let pattern = Ulid::new();

    let insert = format!(
        "INSERT INTO recurring_patterns (id, user_id, start_time, end_time, event_type, payment_status, area_ids, \
         frequency, \"interval\", start_date, end_date, days_of_week, excluded_dates) \
         VALUES ('{pattern}', '{}', '18:00', '20:00', 'league', 'paid', '{area}', 'weekly', 1, \
         '2024-04-01', '2024-04-30', 'mon', '2024-04-22')",
        Ulid::new()
    );
    // Mondays in April minus the 22nd: 1, 8, 15, 29.
    assert_eq!(client.execute(insert.as_str(), &[]).await.unwrap(), 4);

    let generated = rows(&client, &format!("SELECT * FROM bookings WHERE pattern_id = '{pattern}'")).await;
    assert_eq!(generated.len(), 4);
    assert_eq!(generated[0].get("date"), Some("2024-04-01"));
    assert_eq!(generated[0].get("is_primary"), Some("t"));
    assert!(generated[1..].iter().all(|r| r.get("is_primary") == Some("f")));

    // Regenerating keeps the primary and does not duplicate it.
    assert_eq!(client.execute(insert.as_str(), &[]).await.unwrap(), 4);
    let regenerated = rows(&client, &format!("SELECT * FROM bookings WHERE pattern_id = '{pattern}'")).await;
    assert_eq!(regenerated.len(), 4);
    assert_eq!(regenerated[0].get("id"), generated[0].get("id"));

    assert_eq!(
        client
            .execute(format!("DELETE FROM recurring_patterns WHERE id = '{pattern}'").as_str(), &[])
            .await
            .unwrap(),
        4
    );
    assert!(rows(&client, &format!("SELECT * FROM bookings WHERE area_id = '{area}' AND date >= '2024-04-01' AND date <= '2024-04-30'")).await.is_empty());
}

#[tokio::test]
async fn recurrence_preview() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let dates = rows(
        &client,
        "SELECT * FROM recurrence WHERE frequency = 'monthly' AND start_date = '2024-01-31' AND end_date = '2024-06-30'",
    )
    .await;
    let dates: Vec<&str> = dates.iter().filter_map(|r| r.get("date")).collect();
    assert_eq!(dates, vec!["2024-01-31", "2024-03-31", "2024-05-31"]);
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    let area = sheet(&client, "Sheet A").await;
    let id = Ulid::new();
    client
        .batch_execute(&booking_sql(id, area, "2024-04-02", "09:00", "10:00"))
        .await
        .unwrap();

    let area_str = area.to_string();
    let found = client
        .query("SELECT * FROM bookings WHERE area_id = $1 AND date = $2", &[&area_str, &"2024-04-02"])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get::<_, String>("id"), id.to_string());
}

#[tokio::test]
async fn sql_errors_use_syntax_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let err = client.simple_query("SELECT * FROM sheets").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client.simple_query("SELECT * FROM bookable").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}
