use crate::error::SyncError;
use crate::media::{CreatePhotoRequest, PhotosApi};
use crate::model::{PhotoPreview, RemotePhoto};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// reqwest client for the photos metadata API (bearer token auth).
pub struct HttpPhotosApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct PhotoList {
    results: Vec<RemotePhoto>,
}

#[derive(Serialize)]
struct PreviewsPatch<'a> {
    previews: &'a [PhotoPreview],
}

impl HttpPhotosApi {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.bearer_auth(&self.token).send().await?;
        let status = resp.status().as_u16();
        // 402 Payment Required and 420 are how the API signals a full plan.
        if status == 402 || status == 420 {
            return Err(SyncError::StorageLimitReached.into());
        }
        crate::bridge::check_status(resp).await
    }
}

#[async_trait]
impl PhotosApi for HttpPhotosApi {
    async fn find_or_create_photo(&self, request: &CreatePhotoRequest) -> Result<RemotePhoto> {
        let resp = self
            .send(self.client.post(self.url("/photos")).json(request))
            .await?;
        resp.json().await.context("decoding created photo")
    }

    async fn list_updated_since(
        &self,
        since: DateTime<Utc>,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RemotePhoto>> {
        let since = since.to_rfc3339_opts(SecondsFormat::Millis, true);
        let limit = limit.to_string();
        let mut query = vec![("updatedAt", since.as_str()), ("limit", limit.as_str())];
        if let Some(id) = after_id {
            query.push(("afterId", id));
        }
        let req = self.client.get(self.url("/photos/sorted")).query(&query);
        let list: PhotoList = self.send(req).await?.json().await.context("decoding photo page")?;
        Ok(list.results)
    }

    async fn get_photo(&self, photo_id: &str) -> Result<RemotePhoto> {
        let resp = self
            .send(self.client.get(self.url(&format!("/photos/{photo_id}"))))
            .await?;
        resp.json().await.context("decoding photo")
    }

    async fn update_previews(&self, photo_id: &str, previews: &[PhotoPreview]) -> Result<RemotePhoto> {
        let resp = self
            .send(
                self.client
                    .patch(self.url(&format!("/photos/{photo_id}")))
                    .json(&PreviewsPatch { previews }),
            )
            .await?;
        resp.json().await.context("decoding updated photo")
    }

    async fn delete_photo(&self, photo_id: &str) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/photos/{photo_id}"))))
            .await?;
        Ok(())
    }
}
