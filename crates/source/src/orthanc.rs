//! Orthanc REST client
//!
//! Endpoints used:
//! - `GET    /series`                 series identifiers
//! - `GET    /series/{id}`            `LastUpdate`, `ParentStudy`, `Instances`
//! - `GET    /studies/{id}`           `ParentPatient`
//! - `GET    /instances/{id}/file`    raw instance bytes
//! - `DELETE /series/{id}`            remove a series

use crate::{InstanceSink, SourceClient, SourceError};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use retire_core::{Config, SeriesMetadata, StudyMetadata};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Format of Orthanc's `LastUpdate` field
pub const LAST_UPDATE_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SeriesResource {
    last_update: String,
    parent_study: String,
    #[serde(default)]
    instances: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StudyResource {
    parent_patient: String,
}

/// HTTP client for an Orthanc server
pub struct OrthancClient {
    base: Url,
    http: Client,
    username: Option<String>,
    password: Option<String>,
}

impl OrthancClient {
    /// Create a client for `base_url`; every request is bounded by `timeout`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let base = Url::parse(base_url)
            .map_err(|e| SourceError::Config(format!("invalid server address {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(SourceError::Config(format!("server address {} cannot be a base URL", base_url)));
        }

        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| SourceError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base,
            http,
            username: None,
            password: None,
        })
    }

    /// Client for the server named in a configuration
    pub fn from_config(config: &Config) -> Result<Self, SourceError> {
        let client = Self::new(&config.server_url(), config.request_timeout())?;
        Ok(match &config.source.username {
            Some(user) => client.with_basic_auth(user, config.source.password.as_deref()),
            None => client,
        })
    }

    /// Authenticate every request with HTTP basic auth
    pub fn with_basic_auth(mut self, username: &str, password: Option<&str>) -> Self {
        self.username = Some(username.to_string());
        self.password = password.map(str::to_string);
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Config(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    /// Send a request and map transport failures and error statuses
    async fn send(&self, method: Method, segments: &[&str]) -> Result<Response, SourceError> {
        let url = self.endpoint(segments)?;
        let resource = url.path().to_string();

        let response = self
            .request(method, url)
            .send()
            .await
            .map_err(|e| map_transport(e, &resource))?;

        check_status(response.status(), &resource)?;
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, SourceError> {
        let response = self.send(Method::GET, segments).await?;
        let resource = response.url().path().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport(e, &resource))?;

        serde_json::from_slice(&body).map_err(|e| SourceError::Decode {
            resource,
            message: e.to_string(),
        })
    }
}

fn map_transport(err: reqwest::Error, resource: &str) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout(resource.to_string())
    } else if let Some(status) = err.status() {
        SourceError::Server {
            status: status.as_u16(),
            resource: resource.to_string(),
        }
    } else {
        SourceError::Transport {
            resource: resource.to_string(),
            message: err.to_string(),
        }
    }
}

fn check_status(status: StatusCode, resource: &str) -> Result<(), SourceError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(SourceError::NotFound(resource.to_string()))
    } else {
        Err(SourceError::Server {
            status: status.as_u16(),
            resource: resource.to_string(),
        })
    }
}

/// Parse Orthanc's `LastUpdate` (`20180913T101010`), interpreted as UTC
pub fn parse_last_update(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    NaiveDateTime::parse_from_str(value, LAST_UPDATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl SourceClient for OrthancClient {
    async fn list_series(&self) -> Result<Vec<String>, SourceError> {
        let series: Vec<String> = self.get_json(&["series"]).await?;
        debug!(count = series.len(), "Listed series on source");
        Ok(series)
    }

    async fn get_series_metadata(&self, series_id: &str) -> Result<SeriesMetadata, SourceError> {
        let resource: SeriesResource = self.get_json(&["series", series_id]).await?;

        let last_update = parse_last_update(&resource.last_update).ok_or_else(|| SourceError::Decode {
            resource: format!("/series/{}", series_id),
            message: format!("invalid LastUpdate {:?}", resource.last_update),
        })?;

        Ok(SeriesMetadata::new(
            series_id,
            resource.parent_study,
            last_update,
            resource.instances,
        ))
    }

    async fn get_study_metadata(&self, study_id: &str) -> Result<StudyMetadata, SourceError> {
        let resource: StudyResource = self.get_json(&["studies", study_id]).await?;
        Ok(StudyMetadata {
            study_id: study_id.to_string(),
            patient_id: resource.parent_patient,
        })
    }

    async fn fetch_instance(&self, instance_id: &str, sink: &mut InstanceSink) -> Result<u64, SourceError> {
        let mut response = self.send(Method::GET, &["instances", instance_id, "file"]).await?;
        let resource = response.url().path().to_string();

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_transport(e, &resource))?
        {
            sink.write_all(&chunk).await.map_err(SourceError::Sink)?;
            written += chunk.len() as u64;
        }
        sink.flush().await.map_err(SourceError::Sink)?;

        Ok(written)
    }

    async fn delete_series(&self, series_id: &str) -> Result<(), SourceError> {
        self.send(Method::DELETE, &["series", series_id]).await?;
        info!(series_id, "Deleted series from source");
        Ok(())
    }
}
