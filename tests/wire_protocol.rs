use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use gearbook::catalog::{EquipmentInfo, StaticCatalog};
use gearbook::engine::Engine;
use gearbook::notify::NotifyHub;
use gearbook::wire;

const DAY: i64 = 86_400_000;
const JAN_1: i64 = 1_704_067_200_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(equipment: &[(Ulid, u32)]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("gearbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let catalog = StaticCatalog::from_entries(
        equipment
            .iter()
            .map(|&(id, quantity)| EquipmentInfo::new(id, quantity)),
    );
    let engine = Arc::new(
        Engine::new(
            dir.join("gearbook.wal"),
            Arc::new(NotifyHub::new()),
            Arc::new(catalog),
        )
        .unwrap(),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    actor: Value,
}

impl Client {
    async fn connect(addr: SocketAddr, id: Ulid, role: &str) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            actor: json!({ "id": id.to_string(), "role": role }),
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.framed.send(line).await.unwrap();
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a line")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Send a command and return its reply, skipping interleaved notifications.
    async fn call(&mut self, command: Value) -> Value {
        let request = json!({ "id": 1, "actor": self.actor, "command": command });
        self.send_raw(&request.to_string()).await;
        loop {
            let line = self.next_line().await;
            if line.get("notification").is_none() {
                return line;
            }
        }
    }

    async fn create(&mut self, equipment: Ulid, from_day: i64, to_day: i64) -> Value {
        self.call(json!({ "create_reservation": {
            "equipment_id": equipment.to_string(),
            "span": { "start": JAN_1 + from_day * DAY, "end": JAN_1 + to_day * DAY },
        }}))
        .await
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn create_then_conflict_over_the_wire() {
    let equipment = Ulid::new();
    let addr = start_test_server(&[(equipment, 1)]).await;
    let mut client = Client::connect(addr, Ulid::new(), "customer").await;

    let created = client.create(equipment, 0, 4).await;
    assert_eq!(created["ok"], true, "{created}");
    assert_eq!(created["id"], 1);
    assert_eq!(created["data"]["status"], "pending");
    assert_eq!(created["data"]["history"].as_array().unwrap().len(), 1);

    let clash = client.create(equipment, 3, 5).await;
    assert_eq!(clash["ok"], false);
    assert_eq!(clash["error"]["code"], "conflict");

    let adjacent = client.create(equipment, 4, 6).await;
    assert_eq!(adjacent["ok"], true, "{adjacent}");
}

#[tokio::test]
async fn error_codes_are_stable() {
    let equipment = Ulid::new();
    let addr = start_test_server(&[(equipment, 1)]).await;
    let mut owner = Client::connect(addr, Ulid::new(), "user").await;
    let mut admin = Client::connect(addr, Ulid::new(), "admin").await;
    let mut stranger = Client::connect(addr, Ulid::new(), "customer").await;

    let unknown = owner.create(Ulid::new(), 0, 1).await;
    assert_eq!(unknown["error"]["code"], "equipment_unavailable");

    let backwards = owner.create(equipment, 2, 1).await;
    assert_eq!(backwards["error"]["code"], "invalid_interval");

    let r = owner.create(equipment, 0, 2).await;
    let id = r["data"]["id"].as_str().unwrap().to_string();

    let peek = stranger.call(json!({ "get_reservation": { "id": id } })).await;
    assert_eq!(peek["error"]["code"], "forbidden");

    let bad_status = admin
        .call(json!({ "transition": { "id": id, "status": "lost" } }))
        .await;
    assert_eq!(bad_status["error"]["code"], "invalid_status");

    let skip = admin
        .call(json!({ "transition": { "id": id, "status": "completed" } }))
        .await;
    assert_eq!(skip["error"]["code"], "illegal_transition");

    let missing = admin
        .call(json!({ "get_reservation": { "id": Ulid::new().to_string() } }))
        .await;
    assert_eq!(missing["error"]["code"], "not_found");
}

#[tokio::test]
async fn malformed_lines_do_not_kill_the_connection() {
    let equipment = Ulid::new();
    let addr = start_test_server(&[(equipment, 1)]).await;
    let mut client = Client::connect(addr, Ulid::new(), "customer").await;

    client.send_raw("this is not json").await;
    let reply = client.next_line().await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "bad_request");

    let unknown_field = client
        .call(json!({ "get_reservation": { "id": Ulid::new().to_string(), "verbose": true } }))
        .await;
    assert_eq!(unknown_field["error"]["code"], "bad_request");

    let still_alive = client.create(equipment, 0, 1).await;
    assert_eq!(still_alive["ok"], true);
}

#[tokio::test]
async fn listen_delivers_status_changes() {
    let equipment = Ulid::new();
    let addr = start_test_server(&[(equipment, 2)]).await;
    let admin_id = Ulid::new();
    let mut listener = Client::connect(addr, admin_id, "admin").await;
    let mut owner = Client::connect(addr, Ulid::new(), "customer").await;

    let denied = owner
        .call(json!({ "listen": { "equipment_id": equipment.to_string() } }))
        .await;
    assert_eq!(denied["error"]["code"], "forbidden");

    let ok = listener
        .call(json!({ "listen": { "equipment_id": equipment.to_string() } }))
        .await;
    assert_eq!(ok["data"]["listening"], format!("equipment_{equipment}"));

    let created = owner.create(equipment, 0, 3).await;
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let note = listener.next_line().await;
    assert_eq!(note["notification"]["event"], "reservation.created");
    assert_eq!(note["notification"]["payload"]["reservation"]["id"], id);

    let confirmed = listener
        .call(json!({ "transition": { "id": id, "status": "confirmed", "reason": "ok" } }))
        .await;
    assert_eq!(confirmed["data"]["status"], "confirmed");
    let note = listener.next_line().await;
    assert_eq!(note["notification"]["event"], "reservation.statusChanged");
    assert_eq!(note["notification"]["payload"]["from"], "pending");
    assert_eq!(note["notification"]["payload"]["to"], "confirmed");
    assert_eq!(note["notification"]["payload"]["changed_by"], admin_id.to_string());

    let off = listener.call(json!("unlisten_all")).await;
    assert_eq!(off["ok"], true);
    owner.create(equipment, 5, 6).await;
    let quiet = tokio::time::timeout(Duration::from_millis(200), listener.framed.next()).await;
    assert!(quiet.is_err(), "no notification expected after unlisten_all");
}

#[tokio::test]
async fn review_flow_over_the_wire() {
    let equipment = Ulid::new();
    let addr = start_test_server(&[(equipment, 1)]).await;
    let mut owner = Client::connect(addr, Ulid::new(), "customer").await;
    let mut admin = Client::connect(addr, Ulid::new(), "admin").await;

    let created = owner.create(equipment, 0, 2).await;
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let early = owner.call(json!({ "can_review": { "reservation_id": id } })).await;
    assert_eq!(early["data"]["decision"], "denied");
    assert_eq!(early["data"]["reason"], "ineligible_status");

    admin
        .call(json!({ "transition": { "id": id, "status": "confirmed" } }))
        .await;
    let review = owner
        .call(json!({ "create_review": { "reservation_id": id, "rating": 5, "title": "Great" } }))
        .await;
    assert_eq!(review["ok"], true, "{review}");

    let again = owner
        .call(json!({ "create_review": { "reservation_id": id, "rating": 4 } }))
        .await;
    assert_eq!(again["error"]["code"], "duplicate_review");

    let delete = owner.call(json!({ "delete_reservation": { "id": id } })).await;
    assert_eq!(delete["error"]["code"], "has_review");

    let rating = owner
        .call(json!({ "equipment_rating": { "equipment_id": equipment.to_string() } }))
        .await;
    assert_eq!(rating["data"]["count"], 1);
    assert_eq!(rating["data"]["average"], 5.0);
}
