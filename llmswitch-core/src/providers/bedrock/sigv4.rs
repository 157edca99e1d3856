//! AWS Signature Version 4 request signing (header form).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};

use crate::error::{CoreResult, LlmError};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Unreserved characters per RFC 3986; everything else is escaped.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub(crate) fn uri_encode(s: &str) -> String {
    utf8_percent_encode(s, URI_ENCODE_SET).to_string()
}

pub struct SigningParams<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

pub struct SignableRequest<'a> {
    pub method: &'a http::Method,
    /// Host header value, including a non-default port.
    pub host: &'a str,
    /// Path exactly as it appears on the wire (already percent-encoded).
    pub path: &'a str,
    /// Extra headers to sign; `host` and `x-amz-date` are added.
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

fn hmac(key: &[u8], data: &[u8]) -> CoreResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| LlmError::Other(anyhow::anyhow!("hmac key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub(crate) fn signing_key(
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> CoreResult<Vec<u8>> {
    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// Non-S3 services expect every path segment encoded a second time.
fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Returns (canonical request, signed header list).
pub(crate) fn canonical_request(req: &SignableRequest<'_>, amz_date: &str) -> (String, String) {
    let mut headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    headers.push(("host".to_string(), req.host.to_string()));
    headers.push(("x-amz-date".to_string(), amz_date.to_string()));
    headers.sort();

    let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        req.method.as_str(),
        canonical_uri(req.path),
        canonical_headers,
        signed_headers,
        sha256_hex(req.body)
    );
    (canonical, signed_headers)
}

/// Sign `req` and return the headers to attach: `x-amz-date` and
/// `authorization`.
pub fn sign(req: &SignableRequest<'_>, params: &SigningParams<'_>) -> CoreResult<Vec<(String, String)>> {
    let amz_date = params.time.format("%Y%m%dT%H%M%SZ").to_string();
    let date = params.time.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{}/aws4_request", params.region, params.service);

    let (canonical, signed_headers) = canonical_request(req, &amz_date);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical.as_bytes())
    );
    let key = signing_key(params.secret_key, &date, params.region, params.service)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        params.access_key
    );
    Ok(vec![
        ("x-amz-date".to_string(), amz_date),
        ("authorization".to_string(), authorization),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    #[test]
    fn derives_documented_signing_key() {
        let key = signing_key(SECRET, "20120215", "us-east-1", "iam").unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn get_vanilla_vector() {
        let method = http::Method::GET;
        let req = SignableRequest {
            method: &method,
            host: "example.amazonaws.com",
            path: "/",
            headers: &[],
            body: b"",
        };
        let params = SigningParams {
            access_key: "AKIDEXAMPLE",
            secret_key: SECRET,
            region: "us-east-1",
            service: "service",
            time: Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap(),
        };

        let (canonical, signed) = canonical_request(&req, "20150830T123600Z");
        assert_eq!(
            canonical,
            "GET\n/\n\nhost:example.amazonaws.com\nx-amz-date:20150830T123600Z\n\nhost;x-amz-date\n\
             e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(signed, "host;x-amz-date");

        let headers = sign(&req, &params).unwrap();
        assert_eq!(headers[0], ("x-amz-date".to_string(), "20150830T123600Z".to_string()));
        assert_eq!(
            headers[1].1,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn extra_headers_are_lowercased_trimmed_and_sorted() {
        let method = http::Method::POST;
        let req = SignableRequest {
            method: &method,
            host: "bedrock-runtime.us-east-1.amazonaws.com",
            path: "/model/m/invoke",
            headers: &[("Content-Type", " application/json "), ("Accept", "*/*")],
            body: b"{}",
        };
        let (canonical, signed) = canonical_request(&req, "20240101T000000Z");
        assert_eq!(signed, "accept;content-type;host;x-amz-date");
        assert!(canonical.contains("content-type:application/json\n"));
    }

    #[test]
    fn path_segments_are_encoded_twice() {
        let encoded = format!("/model/{}/invoke", uri_encode("anthropic.claude-v2:1"));
        assert_eq!(encoded, "/model/anthropic.claude-v2%3A1/invoke");
        assert_eq!(canonical_uri(&encoded), "/model/anthropic.claude-v2%253A1/invoke");
        assert_eq!(canonical_uri("/"), "/");
    }
}
