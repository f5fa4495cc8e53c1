use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fixtures::{IdpConfig, RunningIdp};
use serde_json::Value;
use std::collections::HashMap;

async fn discovery(idp: &RunningIdp) -> Value {
    reqwest::get(format!(
        "{}/.well-known/openid-configuration",
        idp.issuer()
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap()
}

fn authorize_url(idp: &RunningIdp, nonce: &str) -> String {
    format!(
        "{}/authorize?client_id=test-client&redirect_uri=http%3A%2F%2Frp.test%2Fcb&response_type=code&scope=openid&nonce={nonce}",
        idp.issuer()
    )
}

fn form(code: &str) -> HashMap<&'static str, String> {
    HashMap::from([
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", "http://rp.test/cb".to_string()),
    ])
}

#[tokio::test]
async fn test_discovery_document() {
    let idp = RunningIdp::spawn(IdpConfig::default()).await.unwrap();

    let json = discovery(&idp).await;

    assert_eq!(json["issuer"], idp.issuer());
    assert_eq!(
        json["token_endpoint"],
        format!("{}/token", idp.issuer())
    );
    assert_eq!(idp.discovery_hits(), 1);
}

#[tokio::test]
async fn test_broken_discovery_answers_500() {
    let idp = RunningIdp::spawn(IdpConfig::default()).await.unwrap();

    let response = reqwest::get(format!(
        "{}/.well-known/openid-configuration",
        idp.broken_issuer()
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_code_exchange_issues_signed_token() {
    let idp = RunningIdp::spawn(IdpConfig::default()).await.unwrap();
    let code = idp.authorize(&authorize_url(&idp, "n-1")).await.unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/token", idp.issuer()))
        .basic_auth("test-client", Some("test-secret"))
        .form(&form(&code))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["expires_in"], 3600);

    let id_token = json["id_token"].as_str().unwrap();
    let payload = id_token.split('.').nth(1).unwrap();
    let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
    assert_eq!(claims["sub"], "u1");
    assert_eq!(claims["name"], "Alice");
    assert_eq!(claims["nonce"], "n-1");
    assert_eq!(claims["aud"], "test-client");
}

#[tokio::test]
async fn test_codes_are_single_use() {
    let idp = RunningIdp::spawn(IdpConfig::default()).await.unwrap();
    let code = idp.authorize(&authorize_url(&idp, "n-1")).await.unwrap();
    let client = reqwest::Client::new();

    let mut statuses = vec![];
    for _ in 0..2 {
        let response = client
            .post(format!("{}/token", idp.issuer()))
            .form(&{
                let mut form = form(&code);
                form.insert("client_id", "test-client".to_string());
                form.insert("client_secret", "test-secret".to_string());
                form
            })
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        vec![reqwest::StatusCode::OK, reqwest::StatusCode::BAD_REQUEST]
    );
    assert_eq!(idp.token_hits(), 2);
}

#[tokio::test]
async fn test_wrong_client_secret_is_rejected() {
    let idp = RunningIdp::spawn(IdpConfig::default()).await.unwrap();
    let code = idp.authorize(&authorize_url(&idp, "n-1")).await.unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/token", idp.issuer()))
        .basic_auth("test-client", Some("guess"))
        .form(&form(&code))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "invalid_client");
}
