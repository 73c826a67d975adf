use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::{DbError, SqlState};
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use inspecta::engine::ConflictPolicy;
use inspecta::tenant::{TenantManager, TenantSettings};
use inspecta::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(policy: ConflictPolicy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("inspecta_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(TenantSettings {
        data_dir: dir,
        compact_threshold: 1000,
        conflict_policy: policy,
        backup_dir: None,
    }));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "inspecta".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, org: &str) -> (Client, mpsc::UnboundedReceiver<DbError>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(org)
        .user("inspecta")
        .password("inspecta");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notice(notice)) => {
                    let _ = tx.send(notice);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
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

fn insert_sql(inspector: Ulid, date: &str, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO appointments (inspector_id, date, start_time, end_time) \
         VALUES ('{inspector}', '{date}', '{start}', '{end}') RETURNING *"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_returns_write_result() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    let result = rows(&client, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    assert_eq!(result.len(), 1);
    let id = result[0].get("id").unwrap().to_string();
    assert!(Ulid::from_string(&id).is_ok());
    assert_eq!(result[0].get("status"), Some("tentative"));
    assert_eq!(result[0].get("conflict_count"), Some("0"));
    assert_eq!(result[0].get("backup_warning"), None);

    let listed = rows(
        &client,
        &format!("SELECT * FROM appointments WHERE inspector_id = '{inspector}'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(id.as_str()));
    assert_eq!(listed[0].get("date"), Some("2024-01-23"));
    assert_eq!(listed[0].get("start_time"), Some("09:00:00"));
    assert_eq!(listed[0].get("has_conflict"), Some("f"));
}

#[tokio::test]
async fn advisory_overlap_is_saved_and_reported() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    let first = rows(&client, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    let first_id = first[0].get("id").unwrap().to_string();
    let second = rows(&client, &insert_sql(inspector, "2024-01-23", "10:00", "12:00")).await;
    assert_eq!(second[0].get("conflict_count"), Some("1"));
    assert_eq!(second[0].get("conflicts_with"), Some(first_id.as_str()));

    let listed = rows(
        &client,
        &format!(
            "SELECT * FROM appointments WHERE inspector_id = '{inspector}' AND date = '2024-01-23'"
        ),
    )
    .await;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|r| r.get("has_conflict") == Some("t")));

    let pairs = rows(
        &client,
        &format!("SELECT * FROM conflicts WHERE inspector_id = '{inspector}'"),
    )
    .await;
    assert_eq!(pairs.len(), 1);
}

#[tokio::test]
async fn plain_insert_warns_with_notice() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, mut notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    client
        .batch_execute(&format!(
            "INSERT INTO appointments (inspector_id, date, start_time, end_time) \
             VALUES ('{inspector}', '2024-01-23', '09:00', '11:00')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO appointments (inspector_id, date, start_time, end_time) \
             VALUES ('{inspector}', '2024-01-23', '10:30', '11:30')"
        ))
        .await
        .unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .ok()
        .flatten()
        .expect("expected a conflict notice");
    assert!(notice.message().contains("overlaps"), "{}", notice.message());
}

#[tokio::test]
async fn touching_boundary_is_clean() {
    let addr = start_test_server(ConflictPolicy::Reject).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    rows(&client, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    let next = rows(&client, &insert_sql(inspector, "2024-01-23", "11:00", "12:00")).await;
    assert_eq!(next[0].get("conflict_count"), Some("0"));
}

#[tokio::test]
async fn reject_policy_refuses_double_booking() {
    let addr = start_test_server(ConflictPolicy::Reject).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    rows(&client, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    let err = client
        .simple_query(&insert_sql(inspector, "2024-01-23", "10:00", "12:00"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    let listed = rows(
        &client,
        &format!("SELECT * FROM appointments WHERE inspector_id = '{inspector}'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn status_transitions_and_cancel() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    let a = rows(&client, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    let a_id = a[0].get("id").unwrap().to_string();
    rows(&client, &insert_sql(inspector, "2024-01-23", "10:00", "12:00")).await;

    let confirmed = rows(
        &client,
        &format!("UPDATE appointments SET status = 'confirmed' WHERE id = '{a_id}' RETURNING *"),
    )
    .await;
    assert_eq!(confirmed[0].get("status"), Some("confirmed"));

    let err = client
        .simple_query(&format!(
            "UPDATE appointments SET status = 'confirmed' WHERE id = '{a_id}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE));

    client
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{a_id}'"))
        .await
        .unwrap();
    let pairs = rows(&client, "SELECT * FROM conflicts").await;
    assert!(pairs.is_empty());

    // Cancelled rows stay visible as history.
    let listed = rows(
        &client,
        &format!("SELECT * FROM appointments WHERE inspector_id = '{inspector}'"),
    )
    .await;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|r| r.get("status") == Some("cancelled")));
}

#[tokio::test]
async fn update_moves_appointment() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    let a = rows(&client, &insert_sql(inspector, "2024-01-23", "09:00", "10:00")).await;
    let a_id = a[0].get("id").unwrap().to_string();
    let b = rows(&client, &insert_sql(inspector, "2024-01-23", "13:00", "14:00")).await;
    assert_eq!(b[0].get("conflict_count"), Some("0"));
    let b_id = b[0].get("id").unwrap().to_string();

    let moved = rows(
        &client,
        &format!(
            "UPDATE appointments SET start_time = '09:30', end_time = '10:30' WHERE id = '{b_id}' RETURNING *"
        ),
    )
    .await;
    assert_eq!(moved[0].get("conflicts_with"), Some(a_id.as_str()));
}

#[tokio::test]
async fn workload_sums_booked_minutes() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new();

    rows(&client, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    rows(&client, &insert_sql(inspector, "2024-01-24", "14:00", "14:30")).await;
    rows(&client, &insert_sql(inspector, "2024-03-01", "09:00", "17:00")).await;

    let w = rows(
        &client,
        &format!(
            "SELECT * FROM workload WHERE inspector_id = '{inspector}' AND date >= '2024-01-01' AND date <= '2024-01-31'"
        ),
    )
    .await;
    assert_eq!(w.len(), 1);
    assert_eq!(w[0].get("appointments"), Some("2"));
    assert_eq!(w[0].get("booked_minutes"), Some("150"));
}

#[tokio::test]
async fn invalid_window_is_rejected() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, _notices) = connect(addr, "north").await;

    let err = client
        .simple_query(&insert_sql(Ulid::new(), "2024-01-23", "11:00", "09:00"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let err = client
        .simple_query("SELECT * FROM bookings")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));
}

#[tokio::test]
async fn organizations_do_not_share_schedules() {
    let addr = start_test_server(ConflictPolicy::Reject).await;
    let (north, _n) = connect(addr, "north").await;
    let (south, _s) = connect(addr, "south").await;
    let inspector = Ulid::new();

    rows(&north, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    let other = rows(&south, &insert_sql(inspector, "2024-01-23", "09:00", "11:00")).await;
    assert_eq!(other[0].get("conflict_count"), Some("0"));
}

#[tokio::test]
async fn extended_query_binds_parameters() {
    let addr = start_test_server(ConflictPolicy::Advisory).await;
    let (client, _notices) = connect(addr, "north").await;
    let inspector = Ulid::new().to_string();

    let inserted = client
        .execute(
            "INSERT INTO appointments (inspector_id, date, start_time, end_time) VALUES ($1, $2, $3, $4)",
            &[&inspector, &"2024-01-23", &"09:00", &"10:00"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let listed = client
        .query(
            "SELECT * FROM appointments WHERE inspector_id = $1",
            &[&inspector],
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let start: String = listed[0].get("start_time");
    assert_eq!(start, "09:00:00");
    let flagged: bool = listed[0].get("has_conflict");
    assert!(!flagged);
}
