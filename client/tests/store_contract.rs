use serde_json::json;
use tasksync_client::{ClientConfig, ClientError, MutationOp, RestTaskStore, SessionContext, TaskStore};
use tasksync_shared::{NewTask, TaskPatch};
use uuid::Uuid;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OWNER: &str = "0b7c4f1e-8d1b-4a55-9a3c-b7d1b0d7e2aa";
const TASK: &str = "7f1c8a52-2b5e-4c59-9a43-0d1f6f0c1e11";

fn ctx() -> SessionContext {
    SessionContext::new(Uuid::parse_str(OWNER).unwrap(), "jwt")
}

fn store(server: &MockServer) -> RestTaskStore {
    RestTaskStore::new(&ClientConfig::new(server.uri(), "anon")).unwrap()
}

fn row(id: &str, title: &str, created_at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "title": title,
        "description": null,
        "is_completed": false,
        "user_id": OWNER,
        "created_at": created_at
    })
}

#[tokio::test]
async fn list_is_scoped_to_owner_and_newest_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/tasks"))
        .and(query_param("select", "*"))
        .and(query_param("user_id", format!("eq.{OWNER}")))
        .and(query_param("order", "created_at.desc"))
        .and(header("apikey", "anon"))
        .and(header("authorization", "Bearer jwt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            row(TASK, "newer", "2024-03-02T00:00:00+00:00"),
            row("1d6a1c8e-0000-4000-8000-000000000001", "older", "2024-03-01T00:00:00+00:00"),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let tasks = store(&server).list(&ctx()).await.unwrap();
    let titles: Vec<_> = tasks.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, vec!["newer", "older"]);
}

#[tokio::test]
async fn list_failure_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/tasks"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "code": "PGRST301",
            "message": "JWT expired"
        })))
        .mount(&server)
        .await;

    match store(&server).list(&ctx()).await {
        Err(ClientError::Fetch(message)) => assert_eq!(message, "JWT expired"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn insert_assigns_owner_and_asks_for_the_row_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/tasks"))
        .and(header("prefer", "return=representation"))
        .and(body_json(json!({
            "title": "buy milk",
            "description": "two litres",
            "is_completed": false,
            "user_id": OWNER
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            row(TASK, "buy milk", "2024-03-01T09:30:00+00:00")
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let task = store(&server)
        .insert(&ctx(), NewTask::new("buy milk", "two litres").unwrap())
        .await
        .unwrap();
    assert_eq!(task.id.to_string(), TASK);
}

#[tokio::test]
async fn update_sends_only_patched_fields() {
    let server = MockServer::start().await;
    let mut done = row(TASK, "buy milk", "2024-03-01T09:30:00+00:00");
    done["is_completed"] = json!(true);
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tasks"))
        .and(query_param("id", format!("eq.{TASK}")))
        .and(query_param("user_id", format!("eq.{OWNER}")))
        .and(body_json(json!({"is_completed": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([done])))
        .expect(1)
        .mount(&server)
        .await;

    let task = store(&server)
        .update(&ctx(), Uuid::parse_str(TASK).unwrap(), TaskPatch::completion(true))
        .await
        .unwrap();
    assert!(task.is_completed);
}

#[tokio::test]
async fn update_of_missing_row_is_a_mutation_error() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let err = store(&server)
        .update(&ctx(), Uuid::new_v4(), TaskPatch::edit("x", "").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Mutation { op: MutationOp::Update, .. }
    ));
}

#[tokio::test]
async fn delete_targets_one_owned_row() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v1/tasks"))
        .and(query_param("id", format!("eq.{TASK}")))
        .and(query_param("user_id", format!("eq.{OWNER}")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    store(&server)
        .delete(&ctx(), Uuid::parse_str(TASK).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_delete_is_a_mutation_error() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v1/tasks"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "message": "permission denied for table tasks"
        })))
        .mount(&server)
        .await;

    let err = store(&server)
        .delete(&ctx(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "could not delete task: permission denied for table tasks"
    );
}
