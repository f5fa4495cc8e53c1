use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fixtures::{IdpConfig, RunningIdp};
use oidc_login::oidc::{ClientConfig, IdTokenVerifier, OidcError, ProviderMetadata};

fn metadata(idp: &RunningIdp) -> ProviderMetadata {
    let issuer = idp.issuer();
    ProviderMetadata::from_json(
        &serde_json::json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/jwks.json"),
        })
        .to_string(),
    )
    .unwrap()
}

/// An RS256 token naming a key the provider never published
fn token_with_unknown_kid() -> String {
    format!(
        "{}.e30.sig",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT","kid":"rotated-away"}"#)
    )
}

#[tokio::test]
async fn test_unknown_kid_does_not_refetch_a_fresh_key_set() {
    let idp = RunningIdp::spawn(IdpConfig::default()).await.unwrap();
    let metadata = metadata(&idp);
    let config = ClientConfig::new(
        "test-client",
        "test-secret",
        idp.issuer(),
        "http://rp.test/callback",
    );
    let verifier = IdTokenVerifier::new(reqwest::Client::new(), Duration::from_secs(5));
    let token = token_with_unknown_kid();

    for _ in 0..3 {
        let result = verifier
            .verify(&token, &metadata, &config, Some("nonce"))
            .await;

        assert!(
            matches!(result, Err(OidcError::Verification(msg)) if msg.contains("rotated-away"))
        );
    }

    assert_eq!(idp.jwks_hits(), 1);
}
