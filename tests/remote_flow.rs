use std::fs;
use std::net::TcpListener as StdListener;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

use profiledb::client::Client;
use profiledb::config::Config;
use profiledb::demo::AuthenticateDemo;
use profiledb::engine::Engine;
use profiledb::error::{DbError, ErrorCode};
use profiledb::models::{Bin, Filter, IndexType, Key, Statement, TaskStatus, Value};
use profiledb::rest::create_router;

/// Serve `engine` on an ephemeral port from a background runtime.
fn spawn_server(engine: Engine) -> u16 {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
            tx.send(listener.local_addr().expect("addr").port()).expect("port");
            axum::serve(listener, create_router(engine).into_make_service())
                .await
                .expect("serve");
        });
    });
    rx.recv().expect("server port")
}

fn config(port: u16) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port,
        udf_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("udf"),
        poll_interval: Duration::from_millis(10),
        batch_size: 2,
        ..Config::default()
    }
}

#[test]
fn test_demo_over_http() {
    let dir = tempdir().expect("temp");
    let engine = Engine::open(dir.path().join("db")).expect("open");
    let port = spawn_server(engine.clone());

    let mut demo = AuthenticateDemo::connect(&config(port)).expect("connect");
    let mut out: Vec<u8> = Vec::new();
    let report = demo.run(&mut out).expect("demo run");
    demo.teardown().unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("register "));
    assert!(text.ends_with("query for Mary\nResult: true\n"));
    assert_eq!(report.results, vec![Value::Bool(true)]);
    assert_eq!(engine.open_cursors(), 0);
}

#[test]
fn test_errors_keep_their_codes_over_http() {
    let dir = tempdir().expect("temp");
    let engine = Engine::open(dir.path().join("db")).expect("open");
    let port = spawn_server(engine.clone());
    let client = Client::connect(&config(port)).expect("connect");

    let key = Key::new("test", "profile", "4");
    client
        .put(&key, &[Bin::new("username", "Mary"), Bin::new("password", "ghjks")])
        .unwrap();
    let record = client.get(&key).unwrap().expect("stored");
    assert_eq!(record.get("username"), Some(&Value::from("Mary")));
    assert_eq!(record.generation, 1);
    assert!(client.get(&Key::new("test", "profile", "9")).unwrap().is_none());

    let unindexed = Statement::new("test", "profile").with_filter(Filter::equal("password", "ghjks"));
    let err = client.query(&unindexed).err().expect("needs an index");
    assert!(matches!(err, DbError::Remote { .. }));
    assert_eq!(err.code(), ErrorCode::IndexNotFound);

    let err = client
        .query_aggregate(&Statement::new("test", "profile"), "nosuch", "f", vec![])
        .err()
        .expect("unknown module");
    assert_eq!(err.code(), ErrorCode::UdfNotFound);

    let err = client.info("bogus").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCommand);
    assert_eq!(client.info("namespaces").unwrap(), "test");

    // Paging and explicit close through the wire.
    let mut scan = client.query(&Statement::new("test", "profile")).unwrap();
    assert!(scan.next_record().unwrap().is_some());
    assert!(scan.next_record().unwrap().is_none());
    scan.close().unwrap();
    scan.close().unwrap();
    assert!(matches!(scan.next_record(), Err(DbError::CursorClosed)));
    drop(scan);
    assert_eq!(engine.open_cursors(), 0);

    assert!(client.delete(&key).unwrap());
    assert!(!client.delete(&key).unwrap());
}

#[test]
fn test_names_with_url_delimiters_round_trip_over_http() {
    let dir = tempdir().expect("temp");
    let engine = Engine::open(dir.path().join("db")).expect("open");
    let port = spawn_server(engine.clone());
    let client = Client::connect(&config(port)).expect("connect");

    let key = Key::new("test", "users", "7");
    client.put(&key, &[Bin::new("user", "ann")]).unwrap();

    let task = client
        .create_index("test", "users", "user#idx", "user", IndexType::String)
        .unwrap();
    task.wait_till_complete().unwrap();
    assert_eq!(task.query_status().unwrap(), TaskStatus::Complete);
    assert_eq!(engine.info("sindex").unwrap().matches("user#idx").count(), 1);

    let by_user = Statement::new("test", "users").with_filter(Filter::equal("user", "ann"));
    assert_eq!(client.query(&by_user).unwrap().count(), 1);

    let udfs = dir.path().join("udf");
    fs::create_dir_all(&udfs).unwrap();
    let path = udfs.join("odd?name#1.udf");
    fs::write(&path, "function total()\n    count\nend\n").unwrap();
    let registered = client.register_udf(&path).unwrap();
    registered.wait_till_complete().unwrap();
    let totals: Vec<Value> = client
        .query_aggregate(&Statement::new("test", "users"), "odd?name#1", "total", vec![])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(totals, vec![Value::Int(1)]);

    client.remove_udf("odd?name#1.udf").unwrap();
    assert_eq!(client.remove_udf("odd?name#1.udf").unwrap_err().code(), ErrorCode::UdfNotFound);
    client.drop_index("test", "user#idx").unwrap();
    assert_eq!(task.query_status().unwrap_err().code(), ErrorCode::IndexNotFound);
}

#[test]
fn test_connect_to_closed_port_fails() {
    let port = {
        let listener = StdListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let err = Client::connect(&config(port)).err().expect("nothing listening");
    assert!(matches!(err, DbError::Connection(_)));
}
