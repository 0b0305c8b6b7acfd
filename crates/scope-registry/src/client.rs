use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::{
    ControlMessage, Interests, PostTelescopeResponse, RegistryError, ResourceRegistry,
    Specifications, StateResponse, TelescopeList, TelescopeRequest, TelescopeStatus,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the telescope backend.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: Client,
    base_url: Url,
}

impl RegistryClient {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| RegistryError::Url(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RegistryError::Url(format!("{base_url} cannot be a base url")));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RegistryError::Network(err.to_string()))?;
        Ok(Self { http, base_url })
    }

    pub async fn create_telescope(
        &self,
        telescope: &TelescopeRequest,
    ) -> Result<PostTelescopeResponse, RegistryError> {
        // The backend routes creation on the trailing slash.
        let url = self.endpoint(&["telescopes", ""])?;
        debug!(target = "registry.http", %url, "creating telescope");
        let res = self.http.post(url).json(telescope).send().await?;
        read_json(res, None).await
    }

    pub async fn update_telescope(
        &self,
        telescope_id: &str,
        telescope: &TelescopeRequest,
    ) -> Result<PostTelescopeResponse, RegistryError> {
        let url = self.endpoint(&["telescopes", telescope_id])?;
        debug!(target = "registry.http", %url, "updating telescope");
        let res = self.http.put(url).json(telescope).send().await?;
        read_json(res, Some(telescope_id)).await
    }

    pub async fn delete_telescope(&self, telescope_id: &str) -> Result<(), RegistryError> {
        let url = self.endpoint(&["telescopes", telescope_id])?;
        debug!(target = "registry.http", %url, "deleting telescope");
        let res = self.http.delete(url).send().await?;
        discard_body(res, Some(telescope_id)).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RegistryError::Url("cannot mutate backend url path".into()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ResourceRegistry for RegistryClient {
    async fn list(&self) -> Result<TelescopeList, RegistryError> {
        let url = self.endpoint(&["telescopes", "list"])?;
        debug!(target = "registry.http", %url, "listing telescopes");
        let res = self.http.get(url).send().await?;
        read_json(res, None).await
    }

    async fn details(&self, telescope_id: &str) -> Result<Specifications, RegistryError> {
        let url = self.endpoint(&["telescopes", telescope_id])?;
        debug!(target = "registry.http", %url, "loading telescope details");
        let res = self.http.get(url).send().await?;
        read_json(res, Some(telescope_id)).await
    }

    async fn set_status(
        &self,
        holder_id: &str,
        telescope_id: &str,
        status: TelescopeStatus,
    ) -> Result<StateResponse, RegistryError> {
        let url = self.endpoint(&[
            "telescopes",
            holder_id,
            telescope_id,
            status.as_path_segment(),
        ])?;
        debug!(target = "registry.http", %url, %status, "updating telescope status");
        let res = self.http.post(url).send().await?;
        let res = check_status(res, Some(telescope_id)).await?;
        // The transition was accepted from here on; a lost body is a decode
        // failure, not a network one.
        let body = res
            .text()
            .await
            .map_err(|err| RegistryError::Decode(format!("response body lost: {err}")))?;
        // Releases may answer with an empty body or `null`.
        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(StateResponse::default());
        }
        serde_json::from_str(trimmed).map_err(|err| RegistryError::Decode(err.to_string()))
    }

    async fn publish_interests(
        &self,
        telescope_id: &str,
        interests: &Interests,
    ) -> Result<(), RegistryError> {
        let url = self.endpoint(&["telescopes", "interests", telescope_id])?;
        debug!(target = "registry.http", %url, topics = interests.interesting.len(), "publishing interests");
        let res = self.http.post(url).json(interests).send().await?;
        discard_body(res, Some(telescope_id)).await
    }

    async fn control(
        &self,
        telescope_id: &str,
        message: &ControlMessage,
    ) -> Result<(), RegistryError> {
        let url = self.endpoint(&["telescopes", "control", telescope_id])?;
        let res = self.http.post(url).json(message).send().await?;
        discard_body(res, Some(telescope_id)).await
    }
}

async fn check_status(res: Response, telescope_id: Option<&str>) -> Result<Response, RegistryError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let path = res.url().path().to_string();
    let body = res.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => RegistryError::NotFound(telescope_id.map(str::to_string).unwrap_or(path)),
        StatusCode::CONFLICT | StatusCode::LOCKED => RegistryError::Conflict {
            telescope_id: telescope_id.unwrap_or_default().to_string(),
            reason: if body.trim().is_empty() {
                status.to_string()
            } else {
                body
            },
        },
        _ => RegistryError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        },
    })
}

async fn read_json<T: DeserializeOwned>(
    res: Response,
    telescope_id: Option<&str>,
) -> Result<T, RegistryError> {
    let res = check_status(res, telescope_id).await?;
    res.json::<T>()
        .await
        .map_err(|err| RegistryError::Decode(err.to_string()))
}

async fn discard_body(res: Response, telescope_id: Option<&str>) -> Result<(), RegistryError> {
    let res = check_status(res, telescope_id).await?;
    let _ = res.bytes().await;
    Ok(())
}
