//! HttpImageFetcher - reqwest による画像ダウンロード
//!
//! 一時ファイル（`<dest>.part`）に書いてから rename する。途中で失敗したら
//! 一時ファイルを消すので、`dest` には完全なファイルしか残らない。

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, REFERER};
use reqwest::{Client, Proxy, redirect};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::config::{ImageSettings, ProxySettings};
use crate::domain::ScrapeError;
use crate::ports::ImageFetcher;

const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

pub struct HttpImageFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpImageFetcher {
    pub fn new(settings: &ImageSettings, proxy: Option<&ProxySettings>) -> Result<Self, ScrapeError> {
        let timeout = Duration::from_millis(settings.timeout_ms);
        let mut builder = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::limited(settings.max_redirects));

        builder = match proxy {
            Some(p) => {
                let mut proxy = Proxy::all(p.url()).map_err(|e| ScrapeError::Image(e.to_string()))?;
                if let Some((user, pass)) = p.credentials() {
                    proxy = proxy.basic_auth(user, pass);
                }
                builder.proxy(proxy)
            }
            // only the configured proxy is used, never one from the environment
            None => builder.no_proxy(),
        };

        let client = builder
            .build()
            .map_err(|e| ScrapeError::Image(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    async fn download(&self, url: &Url, referer: &Url, tmp: &Path) -> Result<u64, ScrapeError> {
        let response = self
            .client
            .get(url.clone())
            .header(REFERER, referer.as_str())
            .header(ACCEPT, IMAGE_ACCEPT)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::BadStatus {
                status: i64::from(status.as_u16()),
                url: url.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| ScrapeError::Image(format!("create {}: {e}", tmp.display())))?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| self.classify(e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ScrapeError::Image(e.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ScrapeError::Image(e.to_string()))?;
        Ok(written)
    }

    fn classify(&self, e: reqwest::Error) -> ScrapeError {
        if e.is_timeout() {
            ScrapeError::Timeout {
                op: "image download",
                after: self.timeout,
            }
        } else {
            ScrapeError::Network(e.to_string())
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &Url, referer: &Url, dest: &Path) -> Result<u64, ScrapeError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScrapeError::Image(format!("create {}: {e}", parent.display())))?;
        }

        let tmp = part_path(dest);
        let result = match self.download(url, referer, &tmp).await {
            Ok(bytes) => tokio::fs::rename(&tmp, dest)
                .await
                .map(|_| bytes)
                .map_err(|e| ScrapeError::Image(format!("rename to {}: {e}", dest.display()))),
            Err(e) => Err(e),
        };

        if result.is_err() {
            // missing tmp file is fine here
            let _ = tokio::fs::remove_file(&tmp).await;
        } else {
            debug!(url = %url, dest = %dest.display(), "image saved");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves `response` verbatim to every connection; returns the base url.
    async fn serve(response: &'static [u8]) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    fn fetcher(timeout_ms: u64) -> HttpImageFetcher {
        let settings = ImageSettings {
            timeout_ms,
            ..ImageSettings::default()
        };
        HttpImageFetcher::new(&settings, None).unwrap()
    }

    #[tokio::test]
    async fn writes_image_and_removes_temp_file() {
        let base = serve(
            b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 4\r\nConnection: close\r\n\r\nPNG!",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("CLAAS").join("P1.png");

        let bytes = fetcher(5_000)
            .fetch(&base.join("img/p1.png").unwrap(), &base, &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 4);
        assert_eq!(std::fs::read(&dest).unwrap(), b"PNG!");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn error_status_leaves_nothing_behind() {
        let base = serve(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("P404.jpg");

        let err = fetcher(5_000)
            .fetch(&base.join("missing.jpg").unwrap(), &base, &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, ScrapeError::BadStatus { status: 404, .. }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        // bind then drop to get a closed port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.jpg");
        let url = Url::parse(&format!("http://{addr}/x.jpg")).unwrap();

        let err = fetcher(2_000).fetch(&url, &url, &dest).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Network(_) | ScrapeError::Timeout { .. }));
        assert!(!dest.exists());
    }
}
