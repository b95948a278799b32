use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use roost::tenant::TenantManager;
use roost::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("roost_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "roost".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("roost")
        .password("roost");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> Client {
    connect_db(addr, "test").await
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

async fn register(client: &Client, name: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, username, email, phone) VALUES ('{id}', '{name}', '{name}@example.com', '+1 555 {name}')"
        ))
        .await
        .unwrap();
    id
}

/// A listing free for all of June 2025.
async fn june_listing(client: &Client, host: Ulid, title: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO listings (id, host_id, title, location, capacity) VALUES ('{id}', '{host}', '{title}', 'Bergen', 4)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO availability (listing_id, start, "end") VALUES ('{id}', '2025-06-01', '2025-06-30')"#
        ))
        .await
        .unwrap();
    id
}

async fn book(client: &Client, listing: Ulid, user: Ulid, start: &str, end: &str) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, listing_id, user_id, start, "end") VALUES ('{id}', '{listing}', '{user}', '{start}', '{end}')"#
        ))
        .await?;
    Ok(id)
}

async fn free_ranges(client: &Client, listing: Ulid) -> Vec<(String, String)> {
    rows(client, &format!("SELECT * FROM availability WHERE listing_id = '{listing}'"))
        .await
        .iter()
        .map(|r| (r.get("start").unwrap().to_string(), r.get("end").unwrap().to_string()))
        .collect()
}

fn pair(start: &str, end: &str) -> (String, String) {
    (start.to_string(), end.to_string())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let guest = register(&client, "guest").await;
    let listing = june_listing(&client, host, "Harbour flat").await;

    let booking = book(&client, listing, guest, "2025-06-10", "2025-06-12").await.unwrap();
    assert_eq!(
        free_ranges(&client, listing).await,
        vec![pair("2025-06-01", "2025-06-09"), pair("2025-06-13", "2025-06-30")]
    );

    client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, event) VALUES ('{booking}', 'confirm')"
        ))
        .await
        .unwrap();
    let status = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].get("status"), Some("confirmed"));

    // DELETE cancels; the booking stays visible.
    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking}'"))
        .await
        .unwrap();
    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE listing_id = '{listing}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("status"), Some("cancelled"));
    assert_eq!(free_ranges(&client, listing).await, vec![pair("2025-06-01", "2025-06-30")]);
}

#[tokio::test]
async fn rejected_booking_restores_dates() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let guest = register(&client, "guest").await;
    let listing = june_listing(&client, host, "Loft").await;

    let booking = book(&client, listing, guest, "2025-06-01", "2025-06-03").await.unwrap();
    assert_eq!(free_ranges(&client, listing).await, vec![pair("2025-06-04", "2025-06-30")]);

    client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, event) VALUES ('{booking}', 'reject')"
        ))
        .await
        .unwrap();
    assert_eq!(free_ranges(&client, listing).await, vec![pair("2025-06-01", "2025-06-30")]);

    // Terminal: nothing moves it again.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, event) VALUES ('{booking}', 'confirm')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));
}

#[tokio::test]
async fn double_booking_is_refused() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let guest = register(&client, "guest").await;
    let listing = june_listing(&client, host, "Cabin").await;

    book(&client, listing, guest, "2025-06-10", "2025-06-15").await.unwrap();
    let err = book(&client, listing, guest, "2025-06-14", "2025-06-16").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let listed = rows(&client, &format!("SELECT * FROM bookings WHERE listing_id = '{listing}'")).await;
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn availability_conflicts_report_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let listing = june_listing(&client, host, "Studio").await;

    let duplicate = client
        .batch_execute(&format!(
            r#"INSERT INTO availability (listing_id, start, "end") VALUES ('{listing}', '2025-06-01', '2025-06-30')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&duplicate), Some("23505"));

    let overlap = client
        .batch_execute(&format!(
            r#"INSERT INTO availability (listing_id, start, "end") VALUES ('{listing}', '2025-06-20', '2025-07-05')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&overlap), Some("23P01"));

    // Adjacent ranges fuse into one.
    client
        .batch_execute(&format!(
            r#"INSERT INTO availability (listing_id, start, "end") VALUES ('{listing}', '2025-07-01', '2025-07-10')"#
        ))
        .await
        .unwrap();
    assert_eq!(free_ranges(&client, listing).await, vec![pair("2025-06-01", "2025-07-10")]);

    let inverted = client
        .batch_execute(&format!(
            r#"INSERT INTO availability (listing_id, start, "end") VALUES ('{listing}', '2025-08-10', '2025-08-01')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&inverted), Some("22008"));
}

#[tokio::test]
async fn listings_expose_free_ranges_as_json() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let guest = register(&client, "guest").await;
    let listing = june_listing(&client, host, "Boathouse").await;
    book(&client, listing, guest, "2025-06-15", "2025-06-15").await.unwrap();

    let listed = rows(&client, &format!("SELECT * FROM listings WHERE id = '{listing}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("title"), Some("Boathouse"));
    assert_eq!(listed[0].get("capacity"), Some("4"));

    let available: serde_json::Value = serde_json::from_str(listed[0].get("available").unwrap()).unwrap();
    let ranges = available.as_array().unwrap();
    assert_eq!(ranges.len(), 2);
    assert_eq!(ranges[0]["end"], "2025-06-14");
    assert_eq!(ranges[1]["start"], "2025-06-16");

    let missing = rows(&client, &format!("SELECT * FROM listings WHERE id = '{}'", Ulid::new())).await;
    assert!(missing.is_empty());
}

#[tokio::test]
async fn favorites_toggle() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let guest = register(&client, "guest").await;
    let listing = june_listing(&client, host, "Treehouse").await;

    let added = client
        .execute(
            "INSERT INTO favorites (user_id, listing_id) VALUES ($1, $2)",
            &[&guest.to_string(), &listing.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(added, 1);

    let favorites = rows(&client, &format!("SELECT * FROM favorites WHERE user_id = '{guest}'")).await;
    assert_eq!(favorites.len(), 1);
    assert_eq!(favorites[0].get("title"), Some("Treehouse"));

    client
        .batch_execute(&format!(
            "INSERT INTO favorites (user_id, listing_id) VALUES ('{guest}', '{listing}')"
        ))
        .await
        .unwrap();
    let favorites = rows(&client, &format!("SELECT * FROM favorites WHERE user_id = '{guest}'")).await;
    assert!(favorites.is_empty());
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let guest = register(&client, "guest").await;
    let listing = june_listing(&client, host, "Chalet").await;

    let booking = Ulid::new();
    client
        .execute(
            r#"INSERT INTO bookings (id, listing_id, user_id, start, "end") VALUES ($1, $2, $3, $4, $5)"#,
            &[
                &booking.to_string(),
                &listing.to_string(),
                &guest.to_string(),
                &"2025-06-20",
                &"2025-06-22",
            ],
        )
        .await
        .unwrap();

    let found = client
        .query("SELECT * FROM bookings WHERE listing_id = $1", &[&listing.to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let id: &str = found[0].get("id");
    let status: &str = found[0].get("status");
    assert_eq!(id, booking.to_string());
    assert_eq!(status, "pending");
}

#[tokio::test]
async fn dollar_signs_inside_parameters_stay_literal() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let host = register(&client, "host").await;

    let listing = Ulid::new();
    let title = "Loft, $2 off if you quote $1";
    let description = "Pay $5 at the door; it's cash only";
    client
        .execute(
            "INSERT INTO listings (id, host_id, title, location, capacity, description) VALUES ($1, $2, $3, $4, 3, $5)",
            &[&listing.to_string(), &host.to_string(), &title, &"Oslo", &description],
        )
        .await
        .unwrap();

    let listed = rows(&client, &format!("SELECT * FROM listings WHERE id = '{listing}'")).await;
    assert_eq!(listed[0].get("title"), Some(title));
    assert_eq!(listed[0].get("location"), Some("Oslo"));
    assert_eq!(listed[0].get("description"), Some(description));
}

#[tokio::test]
async fn update_user_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let ada = register(&client, "ada").await;
    register(&client, "bob").await;

    let taken = client
        .batch_execute(&format!("UPDATE users SET username = 'bob' WHERE id = '{ada}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&taken), Some("23505"));

    let current = rows(&client, &format!("SELECT * FROM users WHERE id = '{ada}'")).await;
    let own_email = current[0].get("email").unwrap().to_string();
    client
        .batch_execute(&format!(
            "UPDATE users SET username = 'ada', email = '{own_email}' WHERE id = '{ada}'"
        ))
        .await
        .unwrap();

    let updated = client
        .execute(
            "UPDATE users SET phone = $1, username = $2 WHERE id = $3",
            &[&"+47 555 0101", &"ada_l", &ada.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);
    let user = rows(&client, &format!("SELECT * FROM users WHERE id = '{ada}'")).await;
    assert_eq!(user[0].get("username"), Some("ada_l"));
    assert_eq!(user[0].get("phone"), Some("+47 555 0101"));
    assert_eq!(user[0].get("email"), Some(own_email.as_str()));

    let missing = client
        .batch_execute(&format!("UPDATE users SET username = 'x' WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&missing), Some("P0002"));
}

#[tokio::test]
async fn user_uniqueness_and_deletion() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let host = register(&client, "host").await;
    let guest = register(&client, "guest").await;
    let listing = june_listing(&client, host, "Barn").await;
    let booking = book(&client, listing, guest, "2025-06-05", "2025-06-06").await.unwrap();

    let taken = client
        .batch_execute(&format!(
            "INSERT INTO users (id, username, email, phone) VALUES ('{}', 'host', 'other@example.com', '+1 555 0')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&taken), Some("23505"));

    // Removing the guest cancels their booking and frees the dates.
    client
        .batch_execute(&format!("DELETE FROM users WHERE id = '{guest}'"))
        .await
        .unwrap();
    let status = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{booking}'")).await;
    assert_eq!(status[0].get("status"), Some("cancelled"));
    assert_eq!(free_ranges(&client, listing).await, vec![pair("2025-06-01", "2025-06-30")]);

    // Removing the host takes the listing with it.
    client
        .batch_execute(&format!("DELETE FROM users WHERE id = '{host}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM listings").await.is_empty());
    assert!(rows(&client, "SELECT * FROM users").await.is_empty());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let a = connect_db(addr, "north").await;
    let b = connect_db(addr, "south").await;

    register(&a, "ada").await;
    assert_eq!(rows(&a, "SELECT * FROM users").await.len(), 1);
    assert!(rows(&b, "SELECT * FROM users").await.is_empty());
    assert_eq!(tm.len(), 2);
}

#[tokio::test]
async fn bad_statements_report_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let err = client.batch_execute("SELECT * FROM rooms").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42P01"));

    let err = client.batch_execute("SELECT * FROM availability").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42703"));

    let err = client.batch_execute("UPDATE listings SET title = 'x'").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("0A000"));

    let err = client.batch_execute("UPDATE users SET username = 'x'").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42703"));

    let err = client
        .batch_execute(&format!("DELETE FROM listings WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
}
