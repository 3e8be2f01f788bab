//! HTTP probe check (`remote.http`).

use super::{CheckBase, CheckError, CheckResult, Metric, MetricValue, ResultSet};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Cap on how much of the response body is read.
const MAX_BODY_LENGTH: usize = 512 * 1024;

fn default_method() -> String {
    "GET".to_owned()
}

#[derive(Debug, Deserialize)]
struct HttpDetails {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    auth_user: Option<String>,
    #[serde(default)]
    auth_password: Option<String>,
    #[serde(default)]
    follow_redirects: bool,
    #[serde(default)]
    include_body: bool,
}

/// Issues one HTTP request per execution and reports status code, duration,
/// and body size.  Transport failures yield an unavailable result set.
#[derive(Debug)]
pub struct HttpCheck {
    details: HttpDetails,
    method: reqwest::Method,
}

impl HttpCheck {
    pub(super) fn parse(details: &serde_json::Value) -> Result<HttpCheck, CheckError> {
        let details: HttpDetails = serde_json::from_value(details.clone())?;
        let method = details
            .method
            .to_uppercase()
            .parse::<reqwest::Method>()
            .map_err(|e| CheckError::HttpClient(format!("invalid method: {}", e)))?;
        Ok(HttpCheck { details, method })
    }

    pub(super) async fn run(&self, base: &CheckBase) -> Result<ResultSet, CheckError> {
        debug!(
            check_id = %base.check_id,
            url = %self.details.url,
            method = %self.method,
            "running http check"
        );

        let mut crs = ResultSet::new(base);

        let redirects = if self.details.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .timeout(base.timeout)
            .connect_timeout(base.timeout)
            .redirect(redirects)
            .build()
            .map_err(|e| CheckError::HttpClient(e.to_string()))?;

        let mut request = client.request(self.method.clone(), &self.details.url);
        for (name, value) in &self.details.headers {
            request = request.header(name, value);
        }
        if let Some(user) = &self.details.auth_user {
            request = request.basic_auth(user, self.details.auth_password.as_deref());
        }

        let start = Instant::now();
        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                crs.set_unavailable();
                crs.set_status(&format!("request failed: {}", e));
                return Ok(crs);
            }
        };

        let code = response.status().as_u16() as i64;
        let body = match read_body_limited(response).await {
            Ok(body) => body,
            Err(e) => {
                crs.set_unavailable();
                crs.set_status(&format!("body read failed: {}", e));
                return Ok(crs);
            }
        };
        let duration_ms = start.elapsed().as_millis() as i64;

        let mut result = CheckResult::new();
        result.add_metric(Metric::new("code", MetricValue::Int(code), None));
        result.add_metric(Metric::new(
            "duration",
            MetricValue::Int(duration_ms),
            Some("milliseconds"),
        ));
        result.add_metric(Metric::new(
            "bytes",
            MetricValue::Int(body.len() as i64),
            Some("bytes"),
        ));
        if self.details.include_body {
            result.add_metric(Metric::new(
                "body",
                MetricValue::String(String::from_utf8_lossy(&body).into_owned()),
                None,
            ));
        }
        crs.add_result(result);
        crs.set_available();
        crs.set_status(&format!("code {}", code));
        Ok(crs)
    }
}

/// Read at most [`MAX_BODY_LENGTH`] bytes of the response body.
async fn read_body_limited(mut response: reqwest::Response) -> Result<Vec<u8>, reqwest::Error> {
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let remaining = MAX_BODY_LENGTH - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
