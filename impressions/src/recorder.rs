use crate::errors::RecorderError;
use crate::protocol::{ImpressionCountsDto, to_bulk_payload};
use crate::types::{Identity, ImpressionsForDestination};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const SDK_VERSION_HEADER: &str = "SplitSDKVersion";
pub const MACHINE_NAME_HEADER: &str = "SplitSDKMachineName";
pub const MACHINE_IP_HEADER: &str = "SplitSDKMachineIP";
pub const IMPRESSIONS_MODE_HEADER: &str = "SplitSDKImpressionsMode";

const BULK_PATH: &str = "testImpressions/bulk";
const COUNT_PATH: &str = "testImpressions/count";

/// Uploads one identity's impressions to the events backend.
#[async_trait]
pub trait ImpressionRecorder: Send + Sync {
    async fn record(
        &self,
        impressions: &ImpressionsForDestination,
        extra_headers: &HashMap<String, String>,
    ) -> Result<(), RecorderError>;
}

/// Uploads per-feature impression counts gathered in optimized mode.
#[async_trait]
pub trait ImpressionCountRecorder: Send + Sync {
    async fn record_counts(&self, counts: &ImpressionCountsDto) -> Result<(), RecorderError>;
}

pub struct HttpImpressionRecorder {
    client: reqwest::Client,
    bulk_url: Url,
    count_url: Url,
    api_key: String,
}

impl HttpImpressionRecorder {
    pub fn new(events_url: &Url, api_key: String, timeout: Duration) -> Result<Self, RecorderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(HttpImpressionRecorder {
            client,
            bulk_url: join(events_url, BULK_PATH),
            count_url: join(events_url, COUNT_PATH),
            api_key,
        })
    }

    async fn post<T: serde::Serialize + Sync + ?Sized>(
        &self,
        url: &Url,
        headers: HeaderMap,
        body: &T,
    ) -> Result<(), RecorderError> {
        let response = self
            .client
            .post(url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .headers(headers)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RecorderError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ImpressionRecorder for HttpImpressionRecorder {
    async fn record(
        &self,
        impressions: &ImpressionsForDestination,
        extra_headers: &HashMap<String, String>,
    ) -> Result<(), RecorderError> {
        let mut headers = identity_headers(&impressions.identity)?;
        for (name, value) in extra_headers {
            insert_header(&mut headers, name, value)?;
        }

        self.post(&self.bulk_url, headers, &to_bulk_payload(impressions))
            .await
    }
}

#[async_trait]
impl ImpressionCountRecorder for HttpImpressionRecorder {
    async fn record_counts(&self, counts: &ImpressionCountsDto) -> Result<(), RecorderError> {
        self.post(&self.count_url, HeaderMap::new(), counts).await
    }
}

/// Headers attributing a batch to the SDK instance that produced it. Empty
/// machine fields are left out.
fn identity_headers(identity: &Identity) -> Result<HeaderMap, RecorderError> {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, SDK_VERSION_HEADER, &identity.sdk_version)?;
    if !identity.machine_name.is_empty() {
        insert_header(&mut headers, MACHINE_NAME_HEADER, &identity.machine_name)?;
    }
    if !identity.machine_ip.is_empty() {
        insert_header(&mut headers, MACHINE_IP_HEADER, &identity.machine_ip)?;
    }
    Ok(headers)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), RecorderError> {
    let name = HeaderName::try_from(name)
        .map_err(|_| RecorderError::InvalidHeader(name.to_string()))?;
    let value = HeaderValue::try_from(value)
        .map_err(|_| RecorderError::InvalidHeader(format!("{name}: {value}")))?;
    headers.insert(name, value);
    Ok(())
}

fn join(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!("{}/{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ImpressionCountDto, ImpressionsDto};
    use crate::testutils::{TestServer, destination, identity_a};
    use http::StatusCode;

    #[test]
    fn test_join_paths() {
        let base = Url::parse("https://events.example.com/api").unwrap();
        assert_eq!(
            join(&base, BULK_PATH).as_str(),
            "https://events.example.com/api/testImpressions/bulk"
        );
        let base = Url::parse("https://events.example.com/api/").unwrap();
        assert_eq!(
            join(&base, COUNT_PATH).as_str(),
            "https://events.example.com/api/testImpressions/count"
        );
    }

    #[test]
    fn test_identity_headers_skip_empty_fields() {
        let headers = identity_headers(&Identity::new("", "", "php-2.2.2")).unwrap();
        assert_eq!(headers.get(SDK_VERSION_HEADER).unwrap(), "php-2.2.2");
        assert!(headers.get(MACHINE_NAME_HEADER).is_none());
        assert!(headers.get(MACHINE_IP_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_record_posts_bulk_payload() {
        let server = TestServer::start(StatusCode::OK).await;
        let recorder =
            HttpImpressionRecorder::new(&server.url(), "api-key".into(), Duration::from_secs(5))
                .unwrap();

        let extra = HashMap::from([(IMPRESSIONS_MODE_HEADER.to_string(), "debug".to_string())]);
        recorder
            .record(&destination(identity_a(), &[("feature1", 3)]), &extra)
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.path, "/testImpressions/bulk");
        assert_eq!(request.header("authorization"), Some("Bearer api-key"));
        assert_eq!(request.header("splitsdkversion"), Some("go-1.1.1"));
        assert_eq!(request.header("splitsdkmachinename"), Some("machine1"));
        assert_eq!(request.header("splitsdkmachineip"), Some("1.1.1.1"));
        assert_eq!(request.header("splitsdkimpressionsmode"), Some("debug"));

        let body: Vec<ImpressionsDto> = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body[0].feature, "feature1");
        assert_eq!(body[0].key_impressions.len(), 3);
    }

    #[tokio::test]
    async fn test_record_surfaces_error_status() {
        let server = TestServer::start(StatusCode::INTERNAL_SERVER_ERROR).await;
        let recorder =
            HttpImpressionRecorder::new(&server.url(), "api-key".into(), Duration::from_secs(5))
                .unwrap();

        let result = recorder
            .record(&destination(identity_a(), &[("feature1", 1)]), &HashMap::new())
            .await;
        assert!(matches!(
            result,
            Err(RecorderError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_record_counts() {
        let server = TestServer::start(StatusCode::OK).await;
        let recorder =
            HttpImpressionRecorder::new(&server.url(), "api-key".into(), Duration::from_secs(5))
                .unwrap();

        let counts = ImpressionCountsDto {
            per_feature: vec![ImpressionCountDto {
                feature: "feature1".into(),
                time_frame: 0,
                raw_count: 9,
            }],
        };
        recorder.record_counts(&counts).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests[0].path, "/testImpressions/count");
        let body: ImpressionCountsDto = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body, counts);
    }
}
