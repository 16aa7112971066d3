use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

use profiledb::client::{Client, ClientPolicy};
use profiledb::demo::{AuthenticateDemo, NO_RESULTS};
use profiledb::engine::Engine;
use profiledb::error::DbError;
use profiledb::models::{Filter, Statement, Value};

fn policy() -> ClientPolicy {
    ClientPolicy {
        poll_interval: Duration::from_millis(10),
        batch_size: 2,
    }
}

fn udf_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("udf")
}

#[test]
fn test_demo_prints_every_step() {
    let dir = tempdir().expect("temp");
    let engine = Engine::open(dir.path().join("db")).expect("open");
    let mut demo = AuthenticateDemo::with_client(Client::with_backend(engine.clone(), policy()), udf_dir());

    let mut out: Vec<u8> = Vec::new();
    let report = demo.run(&mut out).expect("demo run");
    let text = String::from_utf8(out).unwrap();
    let expected = format!(
        "register {}\ncreate index profileindex\nadd records\nquery on username\nquery for Mary\nResult: true\n",
        udf_dir().join("profile.udf").display()
    );
    assert_eq!(text, expected);
    assert_eq!(report.records, 0);
    assert_eq!(report.results, vec![Value::Bool(true)]);
    assert_eq!(engine.open_cursors(), 0);

    demo.teardown().unwrap();
    demo.teardown().unwrap();
    assert!(!demo.is_connected());
    assert!(matches!(demo.run(&mut Vec::<u8>::new()), Err(DbError::Connection(_))));
}

#[test]
fn test_fixture_queries_are_case_sensitive() {
    let dir = tempdir().expect("temp");
    let engine = Engine::open(dir.path().join("db")).expect("open");
    let demo = AuthenticateDemo::with_client(Client::with_backend(engine.clone(), policy()), udf_dir());
    demo.run(&mut Vec::<u8>::new()).expect("demo run");

    let client = Client::with_backend(engine.clone(), policy());
    let mary = Statement::new("test", "profile").with_filter(Filter::equal("username", "Mary"));
    let records: Vec<_> = client
        .query(&mary)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record.get("password"), Some(&Value::from("ghjks")));

    let lower = Statement::new("test", "profile").with_filter(Filter::equal("username", "mary"));
    assert_eq!(client.query(&lower).unwrap().count(), 0);

    let wrong: Vec<Value> = client
        .query_aggregate(&mary, "profile", "check_password", vec![Value::from("nope")])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(wrong, vec![Value::Bool(false)]);

    let counted: Vec<Value> = client
        .query_aggregate(
            &Statement::new("test", "profile"),
            "profile",
            "count_profiles",
            vec![Value::from("Doug")],
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(counted, vec![Value::Int(1)]);
    assert_eq!(engine.open_cursors(), 0);
}

#[test]
fn test_demo_reruns_against_existing_state() {
    let dir = tempdir().expect("temp");
    let engine = Engine::open(dir.path().join("db")).expect("open");
    for _ in 0..2 {
        let demo = AuthenticateDemo::with_client(Client::with_backend(engine.clone(), policy()), udf_dir());
        let report = demo.run(&mut Vec::<u8>::new()).expect("demo run");
        assert_eq!(report.results, vec![Value::Bool(true)]);
    }
    assert_eq!(engine.info("statistics").unwrap(), "records=5;indexes=1;udfs=1;cursors=0");
}

#[test]
fn test_empty_aggregation_prints_notice_once() {
    let dir = tempdir().expect("temp");
    let udfs = dir.path().join("udf");
    fs::create_dir_all(&udfs).unwrap();
    fs::write(
        udfs.join("profile.udf"),
        "function check_password(candidate)\n    filter rec.password != candidate\n    map true\nend\n",
    )
    .unwrap();

    let engine = Engine::open(dir.path().join("db")).expect("open");
    let demo = AuthenticateDemo::with_client(Client::with_backend(engine.clone(), policy()), &udfs);
    let mut out: Vec<u8> = Vec::new();
    let report = demo.run(&mut out).expect("demo run");
    let text = String::from_utf8(out).unwrap();

    assert!(report.results.is_empty());
    assert_eq!(text.matches(NO_RESULTS).count(), 1);
    assert!(text.ends_with(&format!("query for Mary\n{NO_RESULTS}\n")));
    assert_eq!(engine.open_cursors(), 0);
}

#[test]
fn test_broken_module_stops_the_demo() {
    let dir = tempdir().expect("temp");
    let udfs = dir.path().join("udf");
    fs::create_dir_all(&udfs).unwrap();
    fs::write(udfs.join("profile.udf"), "function check_password(candidate)\n    filter rec.password == candidate\nend\n")
        .unwrap();

    let engine = Engine::open(dir.path().join("db")).expect("open");
    let demo = AuthenticateDemo::with_client(Client::with_backend(engine, policy()), &udfs);
    let mut out: Vec<u8> = Vec::new();
    let err = demo.run(&mut out).unwrap_err();
    assert!(matches!(err, DbError::UdfCompile { ref module, .. } if module == "profile"));
    assert_eq!(String::from_utf8(out).unwrap(), format!("register {}\n", udfs.join("profile.udf").display()));
}
