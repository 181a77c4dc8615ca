//! HTTP surface tests for recurring-billing-service.

mod common;

use common::{date, TestApp, TEST_TENANT_ID};
use recurring_billing::models::PlanPeriod;
use reqwest::{Client, StatusCode};
use rust_decimal_macros::dec;
use serde_json::{json, Value};

macro_rules! spawn_or_skip {
    () => {
        match TestApp::try_spawn().await {
            Some(app) => app,
            None => return,
        }
    };
}

#[tokio::test]
async fn health_check_works() {
    let app = spawn_or_skip!();
    let client = Client::new();

    let response = client
        .get(format!("{}/health", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "recurring-billing-service-test");

    app.cleanup().await;
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let app = spawn_or_skip!();
    let client = Client::new();

    let response = client
        .get(format!("{}/metrics", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    assert!(response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap_or("").contains("text/plain"))
        .unwrap_or(false));

    app.cleanup().await;
}

#[tokio::test]
async fn billing_routes_require_tenant_header() {
    let app = spawn_or_skip!();
    let client = Client::new();

    let response = client
        .get(format!(
            "{}/v1/clients/{}/price-preview",
            app.http_address,
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(format!(
            "{}/v1/clients/{}/price-preview",
            app.http_address,
            uuid::Uuid::new_v4()
        ))
        .header("X-Tenant-ID", "not-a-uuid")
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await;
}

#[tokio::test]
async fn signup_and_payment_over_http() {
    let app = spawn_or_skip!();
    let client = Client::new();
    let plan = app.plan(dec!(25.00), PlanPeriod::Monthly).await;
    let subscriber = app.client(&plan, date(2030, 2, 12), None).await;

    let response = client
        .post(format!(
            "{}/v1/clients/{}/invoices/first",
            app.http_address, subscriber.client_id
        ))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&json!({ "on": "2030-02-01" }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["outcome"], "created");
    let invoice_id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();

    let preview: Value = client
        .get(format!(
            "{}/v1/clients/{}/price-preview",
            app.http_address, subscriber.client_id
        ))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(preview["mode"]["mode"], "standard");

    let pay_url = format!("{}/v1/invoices/{}/pay", app.http_address, invoice_id);
    let response = client
        .post(&pay_url)
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&json!({ "paid_at": "2030-02-10" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["outcome"], "paid");
    assert_eq!(body["settlement"], "on_time");
    assert_eq!(body["successor"]["due_date"], "2030-03-12");

    let response = client
        .post(&pay_url)
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["outcome"], "already_settled");

    app.cleanup().await;
}

#[tokio::test]
async fn empty_reprocess_batch_is_rejected() {
    let app = spawn_or_skip!();
    let client = Client::new();

    let response = client
        .post(format!("{}/v1/invoices/reprocess", app.http_address))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&json!({ "invoice_ids": [] }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    app.cleanup().await;
}

#[tokio::test]
async fn paying_unknown_invoice_is_not_found() {
    let app = spawn_or_skip!();
    let client = Client::new();

    let response = client
        .post(format!(
            "{}/v1/invoices/{}/pay",
            app.http_address,
            uuid::Uuid::new_v4()
        ))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not found"));

    app.cleanup().await;
}

#[tokio::test]
async fn impossible_payment_date_is_rejected_and_invoice_stays_open() {
    let app = spawn_or_skip!();
    let client = Client::new();
    let plan = app.plan(dec!(25.00), PlanPeriod::Monthly).await;
    let subscriber = app.client(&plan, date(2030, 2, 12), None).await;

    let body: Value = client
        .post(format!(
            "{}/v1/clients/{}/invoices/first",
            app.http_address, subscriber.client_id
        ))
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&json!({ "on": "2030-02-01" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let invoice_id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();
    let pay_url = format!("{}/v1/invoices/{}/pay", app.http_address, invoice_id);

    let response = client
        .post(&pay_url)
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .json(&json!({ "paid_at": "2024-13-45" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = client
        .post(&pay_url)
        .header("X-Tenant-ID", TEST_TENANT_ID)
        .header("content-type", "application/json")
        .body(r#"{"paid_at":"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.open_count(subscriber.client_id).await, 1);

    app.cleanup().await;
}
