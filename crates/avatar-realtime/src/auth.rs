//! Request signing for the avatar service handshake.

use crate::error::SessionError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Appends the `host`, `date` and `authorization` query parameters the
/// service checks before accepting the websocket upgrade.
pub fn signed_url(
    base: &str,
    api_key: &str,
    api_secret: &str,
    now: DateTime<Utc>,
) -> Result<Url, SessionError> {
    let mut url = Url::parse(base).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidUrl(format!("{base} has no host")))?
        .to_string();
    let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    let signature_origin = format!("host: {host}\ndate: {date}\nGET {} HTTP/1.1", url.path());
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    mac.update(signature_origin.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization_origin = format!(
        r#"api_key="{api_key}", algorithm="hmac-sha256", headers="host date request-line", signature="{signature}""#
    );
    let authorization = STANDARD.encode(authorization_origin);

    url.query_pairs_mut()
        .append_pair("host", &host)
        .append_pair("date", &date)
        .append_pair("authorization", &authorization);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 8, 9, 10).unwrap()
    }

    #[test]
    fn test_signed_url_carries_query_in_order() {
        let url = signed_url(
            "wss://avatar.example.com/v1/interact",
            "key-1",
            "secret-1",
            fixed_now(),
        )
        .unwrap();

        let keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        assert_eq!(keys, vec!["host", "date", "authorization"]);

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["host"], "avatar.example.com");
        assert_eq!(params["date"], "Tue, 05 Mar 2024 08:09:10 GMT");
        assert_eq!(url.path(), "/v1/interact");
        // Spaces are form-encoded in the raw query.
        assert!(url.query().unwrap().contains("date=Tue%2C+05+Mar+2024"));
    }

    #[test]
    fn test_authorization_signature_verifies() {
        let url = signed_url(
            "wss://avatar.example.com/v1/interact",
            "key-1",
            "secret-1",
            fixed_now(),
        )
        .unwrap();
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let authorization =
            String::from_utf8(STANDARD.decode(&params["authorization"]).unwrap()).unwrap();

        assert!(authorization.starts_with(r#"api_key="key-1", algorithm="hmac-sha256""#));
        let signature = authorization
            .split(r#"signature=""#)
            .nth(1)
            .unwrap()
            .trim_end_matches('"');

        let mut mac = HmacSha256::new_from_slice(b"secret-1").unwrap();
        mac.update(
            b"host: avatar.example.com\ndate: Tue, 05 Mar 2024 08:09:10 GMT\nGET /v1/interact HTTP/1.1",
        );
        mac.verify_slice(&STANDARD.decode(signature).unwrap())
            .expect("signature should verify");
    }

    #[test]
    fn test_url_without_host_is_rejected() {
        let err = signed_url("unix:/run/avatar.sock", "k", "s", fixed_now()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidUrl(_)));
        assert!(signed_url("not a url", "k", "s", fixed_now()).is_err());
    }
}
