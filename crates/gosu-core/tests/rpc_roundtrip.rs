//! End-to-end RPC over a real HTTP listener.

use std::sync::Arc;
use std::time::Duration;

use gosu_client::Client;
use gosu_core::rpc;
use gosu_core::session::Session;
use gosu_core::store::Store;
use gosu_types::{JobInfo, JobList, WhiteboardEntry, WhiteboardKey};
use serde_json::{json, Value};

fn isolate_home() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let dir = std::env::temp_dir().join(format!("gosu-test-home-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::env::set_var("GOSUHOME", &dir);
    });
}

async fn serve_session() -> (Arc<Session>, Client) {
    isolate_home();
    let session = Session::with_store(Arc::new(Store::open_in_memory().unwrap()));
    let server = rpc::serve(session.clone(), &["http://127.0.0.1:0".to_string()])
        .await
        .unwrap();
    let addr = server.local_addrs()[0];
    let client = Client::new(&format!("http://{addr}"));
    session.install_rpc(server);
    (session, client)
}

#[tokio::test]
async fn ping_echoes_the_argument() {
    let (_session, client) = serve_session().await;
    let reply: i64 = client.call("daemon.Ping", 41).await.unwrap();
    assert_eq!(reply, 41);
}

#[tokio::test]
async fn launch_noop_completes_quickly() {
    let (session, client) = serve_session().await;

    let info: JobInfo = client
        .call(
            "job.Launch",
            json!({"id": "quick", "main": "noop", "stdout": "null", "stderr": "null"}),
        )
        .await
        .unwrap();
    assert_eq!(info.id, "quick");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let list: JobList = client.call("job.List", "quick").await.unwrap();
    assert_eq!(list.jobs.len(), 1);
    assert_eq!(list.jobs[0].main.status.code, "complete");

    session.close(None);
}

#[tokio::test]
async fn whiteboard_round_trip_over_http() {
    let (_session, client) = serve_session().await;

    let _: JobInfo = client
        .call(
            "job.Launch",
            json!({"id": "wb", "main": "wait 5s", "stdout": "null", "stderr": "null"}),
        )
        .await
        .unwrap();

    let count: usize = client
        .call(
            "whiteboard.Put",
            &WhiteboardEntry {
                key: WhiteboardKey {
                    job: "wb".into(),
                    key: "color".into(),
                },
                value: json!("teal"),
            },
        )
        .await
        .unwrap();
    assert_eq!(count, 1);

    let entries: Vec<WhiteboardEntry> = client
        .call(
            "whiteboard.Get",
            &WhiteboardKey {
                job: "wb".into(),
                key: "color".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, json!("teal"));
}

#[tokio::test]
async fn remote_errors_surface_verbatim() {
    let (_session, client) = serve_session().await;
    let err = client
        .call::<Value>("job.Nope", Value::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown method"));
}

#[tokio::test]
async fn shutdown_closes_the_session() {
    let (session, client) = serve_session().await;
    let _: Value = client.call("daemon.Shutdown", Value::Null).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), session.scope().done())
        .await
        .expect("session did not shut down");
}
