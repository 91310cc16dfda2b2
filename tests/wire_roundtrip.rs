use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use allocd::engine::{Engine, EngineOptions};
use allocd::model::{Role, User};
use allocd::notify::LogNotifier;
use allocd::wire;

const PASSWORD: &str = "allocd";
const H: i64 = 3_600_000;
/// Monday 2026-01-05 00:00 UTC.
const MON: i64 = 1_767_571_200_000;

// ── Test infrastructure ──────────────────────────────────────

struct Server {
    addr: SocketAddr,
    admin: Ulid,
}

async fn start_test_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("allocd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::open(dir.join("allocd.wal"), Arc::new(LogNotifier), EngineOptions::default()).unwrap(),
    );
    let admin = Ulid::new();
    engine
        .bootstrap_admin(User {
            id: admin,
            name: "admin".into(),
            email: "admin@localhost".into(),
            role: Role::Admin,
            department_id: None,
            club_id: None,
        })
        .await
        .unwrap();

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    Server { addr, admin }
}

async fn connect_as(addr: SocketAddr, user: Ulid, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("allocd")
        .user(user.to_string())
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, user: Ulid) -> Client {
    connect_as(addr, user, PASSWORD).await.unwrap()
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

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn register(admin: &Client, role: &str, email: &str) -> Ulid {
    let id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email, role) VALUES ('{id}', '{email}', '{email}', '{role}')"
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_user_or_bad_password_cannot_log_in() {
    let server = start_test_server().await;
    assert!(connect_as(server.addr, Ulid::new(), PASSWORD).await.is_err());
    assert!(connect_as(server.addr, server.admin, "wrong").await.is_err());
    assert!(connect_as(server.addr, server.admin, PASSWORD).await.is_ok());
}

#[tokio::test]
async fn cancel_over_the_wire_promotes_the_waitlist() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;

    let room = Ulid::new();
    admin
        .batch_execute(&format!("INSERT INTO rooms (id, name, capacity) VALUES ('{room}', 'LHC-101', 120)"))
        .await
        .unwrap();
    let prof = register(&admin, "PROFESSOR", "prof@college.edu").await;
    let lhc = register(&admin, "LHC", "lhc@college.edu").await;
    let prof_client = connect(server.addr, prof).await;
    let lhc_client = connect(server.addr, lhc).await;

    let first = Ulid::new();
    let second = Ulid::new();
    for id in [first, second] {
        prof_client
            .batch_execute(&format!(
                r#"INSERT INTO room_bookings (id, room_id, start, "end", purpose) VALUES ('{id}', '{room}', {}, {}, 'seminar')"#,
                MON + 10 * H,
                MON + 12 * H
            ))
            .await
            .unwrap();
    }

    // Both admitted PENDING; only APPROVED bookings block.
    let listed = rows(&prof_client, &format!("SELECT * FROM room_bookings WHERE room_id = '{room}'")).await;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|r| r.get("status") == Some("PENDING")));

    let approved = rows(
        &lhc_client,
        &format!("INSERT INTO actions (entity_type, entity_id, action) VALUES ('ROOM_BOOKING', '{first}', 'APPROVE')"),
    )
    .await;
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].get("status"), Some("APPROVED"));

    // The second approval now collides and is queued instead.
    let queued = rows(
        &lhc_client,
        &format!("INSERT INTO actions VALUES ('ROOM_BOOKING', '{second}', 'APPROVE')"),
    )
    .await;
    assert_eq!(queued[0].get("status"), Some("WAITLISTED"));
    assert_eq!(queued[0].get("queue_position"), Some("1"));

    let cancelled = rows(
        &prof_client,
        &format!("INSERT INTO actions VALUES ('ROOM_BOOKING', '{first}', 'CANCEL')"),
    )
    .await;
    assert_eq!(cancelled[0].get("status"), Some("CANCELLED"));

    let promoted = rows(
        &prof_client,
        &format!("SELECT * FROM room_bookings WHERE room_id = '{room}' AND status = 'APPROVED'"),
    )
    .await;
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].get("id"), Some(second.to_string().as_str()));
    assert_eq!(promoted[0].get("queue_position"), None);

    let conflict = rows(
        &prof_client,
        &format!(
            r#"SELECT * FROM availability WHERE room_id = '{room}' AND start >= {} AND "end" <= {}"#,
            MON + 11 * H,
            MON + 13 * H
        ),
    )
    .await;
    assert_eq!(conflict[0].get("conflict"), Some("t"));

    let calendar = rows(
        &prof_client,
        &format!(r#"SELECT * FROM calendar WHERE start >= {MON} AND "end" <= {}"#, MON + 24 * H),
    )
    .await;
    assert_eq!(calendar.len(), 1);

    let promotes = rows(&admin, "SELECT * FROM logs WHERE action = 'PROMOTE'").await;
    assert_eq!(promotes.len(), 1);
    assert_eq!(promotes[0].get("old_state"), Some("WAITLISTED"));
    assert_eq!(promotes[0].get("new_state"), Some("APPROVED"));
    assert_eq!(promotes[0].get("total"), Some("1"));
}

#[tokio::test]
async fn resource_stock_is_reported_and_enforced() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;

    let dept = Ulid::new();
    let projector = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, quantity, owner_type, owner_id) VALUES ('{projector}', 'Projector', 2, 'DEPARTMENT', '{dept}')"
        ))
        .await
        .unwrap();
    let prof = register(&admin, "PROFESSOR", "prof@college.edu").await;
    let prof_client = connect(server.addr, prof).await;

    let request = |qty: u32| {
        format!(
            r#"INSERT INTO resource_requests (id, resource_id, quantity, start, "end") VALUES ('{}', '{projector}', {qty}, {}, {})"#,
            Ulid::new(),
            MON + 9 * H,
            MON + 11 * H
        )
    };
    prof_client.batch_execute(&request(2)).await.unwrap();
    // Pending requests hold no stock; only approvals do.
    let first = rows(&prof_client, "SELECT * FROM resource_requests").await;
    let first_id = first[0].get("id").unwrap().to_string();
    rows(
        &admin,
        &format!("INSERT INTO actions VALUES ('RESOURCE_REQUEST', '{first_id}', 'APPROVE')"),
    )
    .await;

    let availability = rows(
        &prof_client,
        &format!(
            r#"SELECT * FROM availability WHERE resource_id = '{projector}' AND start >= {} AND "end" <= {}"#,
            MON + 10 * H,
            MON + 12 * H
        ),
    )
    .await;
    assert_eq!(availability[0].get("available"), Some("0"));

    assert_eq!(sqlstate(&prof_client, &request(1)).await, "22023");
}

#[tokio::test]
async fn errors_carry_distinct_sqlstates() {
    let server = start_test_server().await;
    let admin = connect(server.addr, server.admin).await;
    let student = register(&admin, "STUDENT", "student@college.edu").await;
    let student_client = connect(server.addr, student).await;

    // parse
    assert_eq!(sqlstate(&admin, "SELEC nothing").await, "42601");
    assert_eq!(sqlstate(&admin, "SELECT * FROM nowhere").await, "42601");

    // forbidden
    let room = Ulid::new();
    assert_eq!(
        sqlstate(&student_client, &format!("INSERT INTO rooms VALUES ('{room}', 'LHC-7', 30)")).await,
        "42501"
    );
    assert_eq!(sqlstate(&student_client, "SELECT * FROM logs").await, "42501");

    // validation
    admin
        .batch_execute(&format!("INSERT INTO rooms VALUES ('{room}', 'LHC-7', 30)"))
        .await
        .unwrap();
    assert_eq!(
        sqlstate(
            &admin,
            &format!(r#"INSERT INTO room_bookings (id, room_id, start, "end") VALUES ('{}', '{room}', {}, {MON})"#, Ulid::new(), MON + H)
        )
        .await,
        "22023"
    );

    // not found
    assert_eq!(
        sqlstate(
            &admin,
            &format!("INSERT INTO actions VALUES ('ROOM_BOOKING', '{}', 'CANCEL')", Ulid::new())
        )
        .await,
        "02000"
    );

    // duplicate id
    assert_eq!(
        sqlstate(&admin, &format!("INSERT INTO rooms VALUES ('{room}', 'LHC-8', 30)")).await,
        "40001"
    );

    // The connection stays usable after errors.
    assert_eq!(rows(&admin, "SELECT * FROM rooms").await.len(), 1);
}
