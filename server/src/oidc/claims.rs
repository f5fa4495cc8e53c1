use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::error::{OidcError, Result};

// Token segments are unpadded base64url, but some providers pad them anyway
const SEGMENT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The `aud` claim is either one client id or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == client_id,
            Audience::Multiple(auds) => auds.iter().any(|aud| aud == client_id),
        }
    }
}

/// Claims carried in an identity token's payload.
///
/// Every registered claim is optional here; provider-specific claims end up in
/// `extra`. A registered claim with an unexpected JSON type is left in `extra`
/// rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl From<Map<String, Value>> for Claims {
    fn from(mut payload: Map<String, Value>) -> Self {
        Self {
            sub: take_claim(&mut payload, "sub", string_claim),
            name: take_claim(&mut payload, "name", string_claim),
            iss: take_claim(&mut payload, "iss", string_claim),
            aud: take_claim(&mut payload, "aud", |value| {
                Audience::deserialize(value).ok()
            }),
            nonce: take_claim(&mut payload, "nonce", string_claim),
            iat: take_claim(&mut payload, "iat", seconds_claim),
            exp: take_claim(&mut payload, "exp", seconds_claim),
            extra: payload,
        }
    }
}

/// Moves `key` out of `payload` when `convert` accepts its value
fn take_claim<T>(
    payload: &mut Map<String, Value>,
    key: &str,
    convert: impl FnOnce(&Value) -> Option<T>,
) -> Option<T> {
    let typed = payload.get(key).and_then(convert)?;
    payload.remove(key);
    Some(typed)
}

fn string_claim(value: &Value) -> Option<String> {
    value.as_str().map(str::to_owned)
}

fn seconds_claim(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|seconds| seconds as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

impl Claims {
    /// Looks a claim up by name, registered or provider-specific
    pub fn get(&self, claim: &str) -> Option<Value> {
        let typed = match claim {
            "sub" => self.sub.clone().map(Into::into),
            "name" => self.name.clone().map(Into::into),
            "iss" => self.iss.clone().map(Into::into),
            "nonce" => self.nonce.clone().map(Into::into),
            "iat" => self.iat.map(Into::into),
            "exp" => self.exp.map(Into::into),
            "aud" => self.aud.as_ref().and_then(|aud| serde_json::to_value(aud).ok()),
            _ => None,
        };

        typed.or_else(|| self.extra.get(claim).cloned())
    }
}

/// Decode the payload of an identity token.
///
/// The signature, issuer and audience are NOT checked here. Callers that need
/// that go through [`IdTokenVerifier`](super::verify::IdTokenVerifier).
pub fn extract_claims(id_token: &str) -> Result<Claims> {
    let segments: Vec<&str> = id_token.split('.').collect();
    let [_, payload, _] = segments.as_slice() else {
        return Err(OidcError::ClaimsDecode(format!(
            "expected 3 dot-separated segments, found {}",
            segments.len()
        )));
    };

    let payload = SEGMENT_ENGINE
        .decode(payload)
        .map_err(|e| OidcError::ClaimsDecode(format!("payload is not valid base64url: {e}")))?;

    serde_json::from_slice(&payload)
        .map_err(|e| OidcError::ClaimsDecode(format!("payload is not a JSON claims object: {e}")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Accepts second counts written as integers, floats or numeric strings
pub(crate) fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Seconds>::deserialize(deserializer)?
        .map(|seconds| match seconds {
            Seconds::Integer(value) => Ok(value),
            Seconds::Float(value) => Ok(value as i64),
            Seconds::Text(value) => value.trim().parse().map_err(serde::de::Error::custom),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::oidc::test_support::unsigned_token;

    #[test]
    fn payload_claims_are_decoded() -> Result<()> {
        let claims = extract_claims(&unsigned_token(&json!({"sub": "u1", "name": "Alice"})))?;

        assert_eq!(claims.sub.as_deref(), Some("u1"));
        assert_eq!(claims.name.as_deref(), Some("Alice"));
        assert_eq!(claims.aud, None);
        Ok(())
    }

    #[test]
    fn registered_and_custom_claims_are_kept() -> Result<()> {
        let claims = extract_claims(&unsigned_token(&json!({
            "sub": "u1",
            "iss": "https://idp",
            "aud": ["rp", "api"],
            "nonce": "abc",
            "iat": 1_700_000_000,
            "exp": 1_700_003_600.0,
            "email": "alice@example.com"
        })))?;

        assert!(claims.aud.as_ref().is_some_and(|aud| aud.contains("api")));
        assert_eq!(claims.iat, Some(1_700_000_000));
        assert_eq!(claims.exp, Some(1_700_003_600));
        assert_eq!(claims.get("email"), Some(json!("alice@example.com")));
        assert_eq!(claims.get("nonce"), Some(json!("abc")));
        assert_eq!(claims.get("missing"), None);
        Ok(())
    }

    #[test]
    fn padded_payload_is_accepted() -> Result<()> {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"name":"Al"}"#);
        let claims = extract_claims(&format!("e30.{payload}.sig"))?;

        assert_eq!(claims.name.as_deref(), Some("Al"));
        Ok(())
    }

    #[test]
    fn single_segment_is_rejected() {
        assert!(matches!(
            extract_claims("not-a-token"),
            Err(OidcError::ClaimsDecode(msg)) if msg.contains("found 1")
        ));
    }

    #[test]
    fn four_segments_are_rejected() {
        assert!(matches!(
            extract_claims("a.b.c.d"),
            Err(OidcError::ClaimsDecode(_))
        ));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(matches!(
            extract_claims("e30.***.sig"),
            Err(OidcError::ClaimsDecode(msg)) if msg.contains("base64")
        ));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("[1,2,3]");
        assert!(matches!(
            extract_claims(&format!("e30.{payload}.sig")),
            Err(OidcError::ClaimsDecode(msg)) if msg.contains("JSON")
        ));
    }

    #[test]
    fn numeric_sub_is_kept_as_an_extra_claim() -> Result<()> {
        let claims = extract_claims(&unsigned_token(&json!({"sub": 12345, "name": "Alice"})))?;

        assert_eq!(claims.sub, None);
        assert_eq!(claims.name.as_deref(), Some("Alice"));
        assert_eq!(claims.get("sub"), Some(json!(12345)));
        Ok(())
    }

    #[test]
    fn unparseable_iat_does_not_fail_the_decode() -> Result<()> {
        let claims = extract_claims(&unsigned_token(&json!({
            "sub": "u1",
            "iat": "soon",
            "exp": "1700003600",
            "nonce": ["not", "a", "string"]
        })))?;

        assert_eq!(claims.sub.as_deref(), Some("u1"));
        assert_eq!(claims.iat, None);
        assert_eq!(claims.extra.get("iat"), Some(&json!("soon")));
        assert_eq!(claims.exp, Some(1_700_003_600));
        assert_eq!(claims.nonce, None);
        assert_eq!(claims.get("nonce"), Some(json!(["not", "a", "string"])));
        Ok(())
    }

    #[test]
    fn mistyped_claims_survive_a_serialize_round_trip() -> Result<()> {
        let claims = extract_claims(&unsigned_token(&json!({"sub": 7, "name": "Al"})))?;

        let value = serde_json::to_value(&claims).unwrap();

        assert_eq!(value, json!({"sub": 7, "name": "Al"}));
        Ok(())
    }

    #[test]
    fn missing_optional_claims_are_fine() -> Result<()> {
        assert_eq!(extract_claims(&unsigned_token(&json!({})))?, Claims::default());
        Ok(())
    }
}
