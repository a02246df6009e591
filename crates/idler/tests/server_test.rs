use async_trait::async_trait;
use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD, Engine};
use devbox_idler::{
    compute::{ComputeApi, InstanceRef, Operation, OperationStatus},
    config::{Config, MatchPolicy},
    server::{Server, START_MESSAGE},
    Error, Result,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Records every call and answers with canned instances.
#[derive(Default)]
struct FakeCompute {
    instances: Vec<InstanceRef>,
    fail_operations: bool,
    filters: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeCompute {
    fn with_instances(ids: &[&str]) -> Self {
        Self {
            instances: ids
                .iter()
                .map(|id| InstanceRef {
                    id: id.to_string(),
                    name: format!("code-server-{}", id),
                    zone: "us-central1-a".to_string(),
                    status: "TERMINATED".to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn calls(&self, action: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn record(&self, action: &str, instance: &InstanceRef) -> Result<Operation> {
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), instance.id.clone()));
        Ok(Operation {
            name: format!("{}-{}", action, instance.id),
            status: OperationStatus::Running,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn list_instances(&self, filter: &str) -> Result<Vec<InstanceRef>> {
        self.filters.lock().unwrap().push(filter.to_string());
        Ok(self.instances.clone())
    }

    async fn start_instance(&self, instance: &InstanceRef) -> Result<Operation> {
        self.record("start", instance)
    }

    async fn stop_instance(&self, instance: &InstanceRef) -> Result<Operation> {
        self.record("stop", instance)
    }

    async fn wait_for_operation(&self, operation: &Operation) -> Result<Operation> {
        if self.fail_operations {
            return Err(Error::Provider {
                status: 503,
                message: "backend unavailable".into(),
            });
        }
        Ok(Operation {
            status: OperationStatus::Done,
            ..operation.clone()
        })
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.auth.secret = "SECRET".into();
    config.instance.identifier = "1234567890".into();
    config.gcp.project = "dev-project".into();
    config
}

fn test_server(config: &Config, compute: Arc<FakeCompute>) -> axum_test::TestServer {
    let app = Server::new(config, compute).build_router();
    axum_test::TestServer::new(app).unwrap()
}

fn push_body(payload: &str) -> serde_json::Value {
    json!({
        "message": {
            "data": STANDARD.encode(payload),
            "messageId": "136969346945"
        },
        "subscription": "projects/dev-project/subscriptions/shutdown-idle-instance-push"
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let client = test_server(&config(), Arc::new(FakeCompute::default()));

    let response = client.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_start_rejects_wrong_secret() {
    let compute = Arc::new(FakeCompute::with_instances(&["1234567890"]));
    let client = test_server(&config(), compute.clone());

    let response = client
        .post("/start")
        .add_header("Authorization", "token WRONGSECRET")
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert!(response.text().is_empty());
    assert!(compute.calls("start").is_empty());
    assert!(compute.filters.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_start_rejects_missing_header() {
    let compute = Arc::new(FakeCompute::with_instances(&["1234567890"]));
    let client = test_server(&config(), compute.clone());

    let response = client.get("/start").await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert!(compute.calls("start").is_empty());
}

#[tokio::test]
async fn test_start_with_valid_token() {
    let compute = Arc::new(FakeCompute::with_instances(&["1234567890"]));
    let client = test_server(&config(), compute.clone());

    let response = client
        .get("/start")
        .add_header("Authorization", "token SECRET")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), START_MESSAGE);
    assert_eq!(response.text(), "Starting code-server instance.");

    assert_eq!(compute.calls("start"), vec!["1234567890".to_string()]);
    assert!(compute.calls("stop").is_empty());
    assert_eq!(*compute.filters.lock().unwrap(), vec!["id = 1234567890".to_string()]);
}

#[tokio::test]
async fn test_start_failure_is_a_server_error() {
    let compute = Arc::new(FakeCompute {
        fail_operations: true,
        ..FakeCompute::with_instances(&["1234567890"])
    });
    let client = test_server(&config(), compute.clone());

    let response = client
        .post("/start")
        .add_header("Authorization", "token SECRET")
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(compute.calls("start").len(), 1);
}

#[tokio::test]
async fn test_start_ambiguous_match_under_exactly_one() {
    let mut config = config();
    config.instance.match_policy = MatchPolicy::ExactlyOne;
    let compute = Arc::new(FakeCompute::with_instances(&["1", "2"]));
    let client = test_server(&config, compute.clone());

    let response = client
        .post("/start")
        .add_header("Authorization", "token SECRET")
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(compute.calls("start").is_empty());
}

#[tokio::test]
async fn test_open_incident_stops_instance() {
    let compute = Arc::new(FakeCompute::with_instances(&["1234567890"]));
    let client = test_server(&config(), compute.clone());

    let response = client
        .post("/pubsub/shutdown")
        .json(&push_body(r#"{"incident":{"state":"open"}}"#))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["outcome"], "stopped");
    assert_eq!(body["instances"], 1);
    assert_eq!(compute.calls("stop"), vec!["1234567890".to_string()]);
}

#[tokio::test]
async fn test_closed_incident_is_acknowledged_without_stopping() {
    let compute = Arc::new(FakeCompute::with_instances(&["1234567890"]));
    let client = test_server(&config(), compute.clone());

    let response = client
        .post("/pubsub/shutdown")
        .json(&push_body(r#"{"incident":{"state":"closed"}}"#))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["outcome"], "skipped");
    assert_eq!(body["reason"], "not_open");
    assert!(compute.calls("stop").is_empty());
}

#[tokio::test]
async fn test_garbage_payloads_are_skipped() {
    let compute = Arc::new(FakeCompute::with_instances(&["1234567890"]));
    let client = test_server(&config(), compute.clone());

    let response = client
        .post("/pubsub/shutdown")
        .json(&push_body("this is not json"))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["reason"], "invalid_json");

    let response = client.post("/pubsub/shutdown").text("{{{{").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: serde_json::Value = response.json();
    assert_eq!(body["reason"], "malformed_envelope");

    assert!(compute.calls("stop").is_empty());
}

#[tokio::test]
async fn test_failed_stop_asks_for_redelivery() {
    let compute = Arc::new(FakeCompute {
        fail_operations: true,
        ..FakeCompute::with_instances(&["1234567890"])
    });
    let client = test_server(&config(), compute.clone());

    let response = client
        .post("/pubsub/shutdown")
        .json(&push_body(r#"{"incident":{"state":"open"}}"#))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_push_verification_token() {
    let mut config = config();
    config.auth.pubsub_token = Some("push-token".into());
    let compute = Arc::new(FakeCompute::with_instances(&["1234567890"]));
    let client = test_server(&config, compute.clone());

    let response = client
        .post("/pubsub/shutdown")
        .json(&push_body(r#"{"incident":{"state":"open"}}"#))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert!(compute.calls("stop").is_empty());

    let response = client
        .post("/pubsub/shutdown")
        .add_query_param("token", "push-token")
        .json(&push_body(r#"{"incident":{"state":"open"}}"#))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(compute.calls("stop").len(), 1);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let client = test_server(&config(), Arc::new(FakeCompute::default()));

    client
        .post("/start")
        .add_header("Authorization", "token nope")
        .await;

    let response = client.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.text().contains("devbox_idler_start_requests_total"));
}
