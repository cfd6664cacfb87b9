//! Retrying HTTP(S) downloader used to fetch kernel probe artifacts
//! before the capture engine is constructed. Downloads are blocking, the
//! component runs before event processing starts and has no runtime
//! dependency on the extraction engine.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use crate::util::Throttle;

/// Minimum delay between two diagnostics for unexpected HTTP failures.
const HTTP_WARN_PERIOD: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum Error {
    #[error("no output path set")]
    NoOutput,
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("HTTP request failed with error code {0}")]
    Http(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timeout while retrying to download {0}")]
    RetryTimeout(String),
    #[error("giving up on {url} after {attempts} attempt(s)")]
    RetriesExhausted { url: String, attempts: u32 },
}

/// Builder-style file downloader with bounded retries.
#[derive(Debug)]
pub struct FileDownloader {
    url: String,
    output: Option<PathBuf>,
    retries: u32,
    retry_delay: Duration,
    max_retry_time: Duration,
    connection_timeout: Duration,
    follow_redirects: bool,
    http_warn: Throttle,
}

impl FileDownloader {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            output: None,
            retries: 1,
            retry_delay: Duration::from_secs(1),
            max_retry_time: Duration::from_secs(120),
            connection_timeout: Duration::from_secs(5),
            follow_redirects: true,
            http_warn: Throttle::new(HTTP_WARN_PERIOD),
        }
    }

    pub fn output<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn retries(mut self, times: u32, delay: Duration, max_time: Duration) -> Self {
        self.retries = times;
        self.retry_delay = delay;
        self.max_retry_time = max_time;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    // file name part of the URL, for diagnostics
    fn url_file(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }

    /// Downloads the URL to the configured output path, retrying with the
    /// configured delay until either an attempt succeeds, the retry count
    /// is exhausted or the total retry time runs out. A 404 is reported
    /// once at info level, other HTTP failures are throttled.
    pub fn download(&self) -> Result<(), Error> {
        let output = self.output.as_deref().ok_or(Error::NoOutput)?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.connection_timeout)
            .redirects(if self.follow_redirects { 8 } else { 0 })
            .build();

        let start = Instant::now();
        let mut encountered_404 = false;
        let mut attempts = 0u32;

        for remaining in (1..=self.retries.max(1)).rev() {
            attempts += 1;
            match self.fetch(&agent, output) {
                Ok(()) => return Ok(()),
                Err(Error::Http(404)) => {
                    if !encountered_404 {
                        info!("HTTP request failed with error code 404");
                        encountered_404 = true;
                    }
                }
                Err(Error::Http(code)) => {
                    if self.http_warn.allow() {
                        warn!("unexpected HTTP request failure (HTTP {code})");
                    }
                }
                // a file system error will not go away by retrying
                Err(e @ Error::Io(_)) => return Err(e),
                Err(e) => {
                    if self.http_warn.allow() {
                        warn!("download attempt failed: {e}");
                    }
                }
            }

            if remaining == 1 {
                break;
            }

            thread::sleep(self.retry_delay);
            if start.elapsed() > self.max_retry_time {
                warn!("timeout while retrying to download {}", self.url_file());
                return Err(Error::RetryTimeout(self.url_file().to_string()));
            }
        }

        warn!(
            "failed to download {} after {attempts} attempt(s)",
            self.url_file()
        );
        Err(Error::RetriesExhausted {
            url: self.url_file().to_string(),
            attempts,
        })
    }

    fn fetch(&self, agent: &ureq::Agent, output: &Path) -> Result<(), Error> {
        let response = agent.get(&self.url).call().map_err(|e| match e {
            ureq::Error::Status(code, _) => Error::Http(code),
            ureq::Error::Transport(t) => Error::Transport(t.to_string()),
        })?;

        let mut file = File::create(output)?;
        io::copy(&mut response.into_reader(), &mut file)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    // one-connection-at-a-time HTTP fixture counting the requests it serves
    fn serve(status: &'static str, body: &'static str, hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        format!("http://{addr}/probe.o")
    }

    #[test]
    fn test_download_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve("200 OK", "probe-bytes", hits.clone());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("probe.o");

        FileDownloader::new(url)
            .output(&out)
            .retries(3, Duration::from_millis(10), Duration::from_secs(5))
            .download()
            .unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "probe-bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_download_404_retries_then_fails() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = serve("404 Not Found", "nope", hits.clone());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("probe.o");

        let err = FileDownloader::new(url)
            .output(&out)
            .retries(3, Duration::from_millis(10), Duration::from_secs(5))
            .download()
            .unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_download_requires_output() {
        let err = FileDownloader::new("http://localhost/probe.o")
            .download()
            .unwrap_err();
        assert!(matches!(err, Error::NoOutput));
    }
}
