//! remote.rs
//!
//! Thin client for the three VictoriaMetrics endpoints the patcher needs.
//! No retries and no request timeout beyond the transport default: any
//! transport failure or unexpected status is returned as a fatal error.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::config::Settings;
use crate::errors::PatchError;
use crate::metrics::EXPORTED_BYTES;

pub const EXPORT_PATH: &str = "api/v1/export";
pub const DELETE_PATH: &str = "api/v1/admin/tsdb/delete_series";
pub const IMPORT_PATH: &str = "api/v1/import";

/// Status returned by delete and import on success.
pub const NO_CONTENT: StatusCode = StatusCode::NO_CONTENT;

/// Longest response body quoted in a status error.
const BODY_SNIPPET: usize = 512;

/// Basic-auth credentials, sent only when a user is configured.
#[derive(Clone)]
struct Credentials {
    user: String,
    password: String,
}

/// Client bound to one remote store.
pub struct RemoteStore {
    client: Client,
    base: Url,
    credentials: Option<Credentials>,
}

impl RemoteStore {
    pub fn new(base_url: &str, user: &str, password: &str) -> Result<Self, PatchError> {
        let mut base = Url::parse(base_url)?;
        // Url::join replaces the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(concat!("vm-patch-metrics/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PatchError::Http(base.to_string(), e))?;

        let credentials = (!user.is_empty()).then(|| Credentials {
            user: user.to_string(),
            password: password.to_string(),
        });

        Ok(RemoteStore {
            client,
            base,
            credentials,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, PatchError> {
        RemoteStore::new(&settings.url, &settings.user, &settings.password)
    }

    fn endpoint(&self, path: &str) -> Result<Url, PatchError> {
        Ok(self.base.join(path)?)
    }

    fn post(&self, url: Url) -> RequestBuilder {
        let req = self.client.post(url);
        match &self.credentials {
            Some(c) => req.basic_auth(&c.user, Some(&c.password)),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, url: &Url) -> Result<Response, PatchError> {
        req.send()
            .await
            .map_err(|e| PatchError::Http(url.to_string(), e))
    }

    /// Export every series matching `selector` within `[start, end]` into
    /// `dest`, streaming the response body to disk. Returns bytes written.
    pub async fn export(
        &self,
        selector: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        dest: &Path,
    ) -> Result<u64, PatchError> {
        let mut url = self.endpoint(EXPORT_PATH)?;
        url.query_pairs_mut()
            .append_pair("match[]", selector)
            .append_pair("reduce_mem_usage", "1")
            .append_pair("start", &start.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("end", &end.to_rfc3339_opts(SecondsFormat::Secs, true));

        debug!(%url, "Requesting export");
        let mut resp = self.send(self.post(url.clone()), &url).await?;
        if !resp.status().is_success() {
            return Err(status_error(&url, "2xx", resp).await);
        }

        let mut out = File::create(dest).await.map_err(PatchError::io(dest))?;
        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| PatchError::Http(url.to_string(), e))?
        {
            out.write_all(&chunk).await.map_err(PatchError::io(dest))?;
            written += chunk.len() as u64;
        }
        out.flush().await.map_err(PatchError::io(dest))?;
        out.sync_all().await.map_err(PatchError::io(dest))?;

        EXPORTED_BYTES.inc_by(written);
        Ok(written)
    }

    /// Delete every series matching `selector`, over all time.
    pub async fn delete_series(&self, selector: &str) -> Result<(), PatchError> {
        let mut url = self.endpoint(DELETE_PATH)?;
        url.query_pairs_mut().append_pair("match[]", selector);

        debug!(%url, "Requesting series deletion");
        let resp = self.send(self.post(url.clone()), &url).await?;
        expect_status(&url, NO_CONTENT, resp).await
    }

    /// Upload the newline-delimited records in `source` as the request body.
    pub async fn import(&self, source: &Path) -> Result<(), PatchError> {
        let url = self.endpoint(IMPORT_PATH)?;
        let file = File::open(source).await.map_err(PatchError::io(source))?;
        let len = file
            .metadata()
            .await
            .map_err(PatchError::io(source))?
            .len();

        debug!(%url, bytes = len, "Uploading records");
        let req = self
            .post(url.clone())
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(Body::from(file));
        let resp = self.send(req, &url).await?;
        expect_status(&url, NO_CONTENT, resp).await
    }
}

async fn expect_status(url: &Url, expected: StatusCode, resp: Response) -> Result<(), PatchError> {
    if resp.status() == expected {
        Ok(())
    } else {
        Err(status_error(url, expected.as_str(), resp).await)
    }
}

async fn status_error(url: &Url, expected: &str, resp: Response) -> PatchError {
    let actual = resp.status();
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > BODY_SNIPPET {
        let mut cut = BODY_SNIPPET;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    PatchError::Status {
        endpoint: url.path().to_string(),
        expected: expected.to_string(),
        actual,
        body: body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_resolve_under_base_path() {
        let store = RemoteStore::new("http://vm:8428", "", "").unwrap();
        assert_eq!(
            store.endpoint(IMPORT_PATH).unwrap().as_str(),
            "http://vm:8428/api/v1/import"
        );

        let proxied = RemoteStore::new("http://vmauth:8427/select/0", "", "").unwrap();
        assert_eq!(
            proxied.endpoint(DELETE_PATH).unwrap().as_str(),
            "http://vmauth:8427/select/0/api/v1/admin/tsdb/delete_series"
        );
    }

    #[test]
    fn credentials_only_with_user() {
        assert!(RemoteStore::new("http://vm:8428", "", "secret")
            .unwrap()
            .credentials
            .is_none());
        assert!(RemoteStore::new("http://vm:8428", "admin", "")
            .unwrap()
            .credentials
            .is_some());
    }

    #[test]
    fn bad_url_is_rejected() {
        assert!(matches!(
            RemoteStore::new("not a url", "", ""),
            Err(PatchError::Url(_))
        ));
    }
}
