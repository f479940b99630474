use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

const ROSTER: &str = "Customer ID,Customer Name,Account Status,Latitude,Longitude,Report Company Address,Location,Company,Customer Type
C100,Acme Store,ACTIVE,30.0,-97.0,1 Main St,North,Acme Co,Retail
";

const PAYROLL: &str = "Employee Code,First Name,Last Name,Employment Status,Mobile Phone,Samsara Username
E1,Jo,Smith,Active,512-555-0100,jsmith
E3,Cy,Back,Active,512-555-0300,cback
";

#[derive(Debug, Clone)]
struct Request {
    method: String,
    path: String,
    body: String,
}

/// Minimal HTTP/1.1 responder for the address and driver APIs. One request per
/// connection; every request is recorded.
struct FakeApi {
    base_url: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeApi {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base_url = format!("http://{}", listener.local_addr().expect("addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                handle(stream, &log);
            }
        });
        Self { base_url, requests }
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("lock").clone()
    }
}

fn handle(mut stream: TcpStream, log: &Mutex<Vec<Request>>) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();
    let path = target.split('?').next().unwrap_or_default().to_owned();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length];
    let _ = reader.read_exact(&mut body);
    let body = String::from_utf8_lossy(&body).into_owned();

    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/tags") => serde_json::json!({
            "data": [
                {"id": "t-scope", "name": "ManagedBy:EncompassSync"},
                {"id": "t-q", "name": "CandidateDelete"},
                {"id": "t-north", "name": "North"},
                {"id": "t-acme", "name": "Acme Co"},
                {"id": "t-paycom", "name": "ManagedBy:PaycomSync"}
            ],
            "pagination": {"endCursor": "", "hasNextPage": false}
        }),
        ("GET", "/addresses") => serde_json::json!({
            "data": [
                {"id": "1", "name": "Main Warehouse", "tags": []},
                {"id": "500", "name": "Hand Made", "tags": [{"id": "t-north", "name": "North"}]}
            ],
            "pagination": {"endCursor": "", "hasNextPage": false}
        }),
        ("POST", "/addresses") => serde_json::json!({"data": {"id": "9001"}}),
        ("GET", "/fleet/drivers") if target.contains("driverActivationStatus=deactivated") => {
            serde_json::json!({
                "data": [{
                    "id": "d3", "name": "Cy Back", "username": "cback",
                    "driverActivationStatus": "deactivated",
                    "externalIds": {"employeeCode": "E3"}
                }],
                "pagination": {"endCursor": "", "hasNextPage": false}
            })
        }
        ("GET", "/fleet/drivers") => serde_json::json!({
            "data": [
                {"id": "d2", "name": "Al Gone", "username": "agone",
                 "driverActivationStatus": "active", "externalIds": {"employeeCode": "E2"}},
                {"id": "d4", "name": "Contractor", "username": "contractor",
                 "driverActivationStatus": "active"}
            ],
            "pagination": {"endCursor": "", "hasNextPage": false}
        }),
        ("POST", "/fleet/drivers") => serde_json::json!({"data": {"id": "d9"}}),
        _ => serde_json::json!({}),
    };
    log.lock().expect("lock").push(Request { method, path, body });

    let payload = response.to_string();
    let _ = write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        payload.len(),
        payload
    );
    let _ = stream.flush();
}

fn e2s_cmd(home: &Path, api: &FakeApi) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("e2s"));
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("SAMSARA_API_TOKEN", "test-token")
        .env("SAMSARA_BASE_URL", &api.base_url)
        .env_remove("E2S_DEFAULT_RADIUS_METERS");
    cmd
}

fn full_args(work: &Path) -> Vec<String> {
    vec![
        "full".into(),
        "--encompass-csv".into(),
        work.join("roster.csv").display().to_string(),
        "--warehouses".into(),
        work.join("warehouses.csv").display().to_string(),
        "--out-dir".into(),
        work.join("out").display().to_string(),
    ]
}

#[test]
fn dry_run_reports_create_and_sends_no_writes() {
    let home = TempDir::new().expect("home");
    let work = TempDir::new().expect("work");
    fs::write(work.path().join("roster.csv"), ROSTER).expect("roster");
    fs::write(work.path().join("warehouses.csv"), "samsara_id,name\n1,Main Warehouse\n")
        .expect("warehouses");
    let api = FakeApi::start();

    e2s_cmd(home.path(), &api)
        .args(full_args(work.path()))
        .assert()
        .success()
        .stdout(contains("[dry-run]"))
        .stdout(contains("CREATE"));

    let out = work.path().join("out");
    assert!(!out.join("state.json").exists());
    let diff = fs::read_to_string(out.join("dry_run_diff.csv")).expect("diff csv");
    assert!(diff.contains("C100,Acme Store,CREATE"));
    assert!(out.join("actions.jsonl").exists());
    assert!(out.join("sync_report.csv").exists());

    let requests = api.requests();
    assert!(requests.iter().all(|r| r.method == "GET"), "{requests:?}");
}

#[test]
fn apply_creates_address_and_records_state() {
    let home = TempDir::new().expect("home");
    let work = TempDir::new().expect("work");
    fs::write(work.path().join("roster.csv"), ROSTER).expect("roster");
    fs::write(work.path().join("warehouses.csv"), "samsara_id,name\n1,Main Warehouse\n")
        .expect("warehouses");
    let api = FakeApi::start();

    let mut args = full_args(work.path());
    args.push("--apply".into());
    e2s_cmd(home.path(), &api)
        .args(args)
        .assert()
        .success()
        .stdout(contains("[dry-run]").not());

    let requests = api.requests();
    let posts: Vec<&Request> = requests.iter().filter(|r| r.method == "POST").collect();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].path, "/addresses");
    let body: serde_json::Value = serde_json::from_str(&posts[0].body).expect("post body");
    assert_eq!(body["name"], "Acme Store");
    assert_eq!(body["externalIds"]["encompassid"], "C100");
    assert_eq!(body["geofence"]["circle"]["radiusMeters"], 50);
    let tags: Vec<&str> = body["tagIds"]
        .as_array()
        .expect("tag ids")
        .iter()
        .filter_map(|t| t.as_str())
        .collect();
    assert!(tags.contains(&"t-scope"));
    assert!(tags.contains(&"t-north"));

    // Neither the warehouse nor the unscoped hand-made address is touched.
    assert!(requests
        .iter()
        .filter(|r| r.method != "GET")
        .all(|r| r.method == "POST"));

    let state = fs::read_to_string(work.path().join("out").join("state.json")).expect("state");
    assert!(state.contains("\"9001\""));
}

fn drivers_args(work: &Path) -> Vec<String> {
    vec![
        "drivers".into(),
        "--paycom-csv".into(),
        work.join("paycom.csv").display().to_string(),
        "--out-dir".into(),
        work.join("out").display().to_string(),
    ]
}

#[test]
fn drivers_dry_run_plans_without_writes() {
    let home = TempDir::new().expect("home");
    let work = TempDir::new().expect("work");
    fs::write(work.path().join("paycom.csv"), PAYROLL).expect("payroll");
    let api = FakeApi::start();

    e2s_cmd(home.path(), &api)
        .args(drivers_args(work.path()))
        .assert()
        .success()
        .stdout(contains("[dry-run]"))
        .stdout(contains("REACTIVATE"));

    let dir = work.path().join("out").join("drivers");
    let plan = fs::read_to_string(dir.join("drivers_sync_plan.csv")).expect("plan");
    assert!(plan.contains("E1,,Jo Smith,CREATE,new_driver,"));
    assert!(plan.contains("E3,d3,Cy Back,REACTIVATE,status_active,"));
    assert!(plan.contains("E2,d2,Al Gone,DEACTIVATE,orphan,"));
    assert!(!plan.contains(",d4,"));
    assert!(!dir.join("drivers_sync_results.csv").exists());

    let requests = api.requests();
    assert!(requests.iter().all(|r| r.method == "GET"), "{requests:?}");
}

#[test]
fn drivers_apply_creates_reactivates_and_deactivates() {
    let home = TempDir::new().expect("home");
    let work = TempDir::new().expect("work");
    fs::write(work.path().join("paycom.csv"), PAYROLL).expect("payroll");
    let api = FakeApi::start();

    let mut args = drivers_args(work.path());
    args.push("--apply".into());
    e2s_cmd(home.path(), &api).args(args).assert().success();

    let requests = api.requests();
    let post = requests
        .iter()
        .find(|r| r.method == "POST" && r.path == "/fleet/drivers")
        .expect("create call");
    let body: serde_json::Value = serde_json::from_str(&post.body).expect("post body");
    assert_eq!(body["username"], "jsmith");
    assert_eq!(body["externalIds"]["employeeCode"], "E1");
    assert_eq!(body["tagIds"][0], "t-paycom");

    let patch_body = |path: &str| -> serde_json::Value {
        let request = requests
            .iter()
            .find(|r| r.method == "PATCH" && r.path == path)
            .unwrap_or_else(|| panic!("no PATCH {path}: {requests:?}"));
        serde_json::from_str(&request.body).expect("patch body")
    };
    assert_eq!(patch_body("/fleet/drivers/d3")["driverActivationStatus"], "active");
    assert_eq!(patch_body("/fleet/drivers/d2")["driverActivationStatus"], "deactivated");
    assert!(!requests.iter().any(|r| r.path == "/fleet/drivers/d4"));

    let results = fs::read_to_string(
        work.path()
            .join("out")
            .join("drivers")
            .join("drivers_sync_results.csv"),
    )
    .expect("results");
    assert!(results.contains("E1,d9,CREATE,ok,"));
}
