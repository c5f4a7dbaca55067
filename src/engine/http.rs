use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Deserialize;

use crate::model::{RunConfig, ServerInfo};

use super::workload::{RawResults, TransferProgress, Workload};

/// Cadence of progress callbacks during a transfer phase.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
/// Chunk size for stream reads and upload body generation (64 KB).
const CHUNK_SIZE: usize = 64 * 1024;
/// Pause after a failed request before retrying.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

const OPERATOR: &str = "Cloudflare";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Meta {
    #[serde(rename = "asOrganization")]
    as_organization: Option<String>,
    colo: Option<MetaColo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MetaColo {
    city: Option<String>,
    cca2: Option<String>,
}

/// Default [`Workload`] over a Cloudflare-style measurement endpoint
/// (`/meta`, `/__down?bytes=N`, `/__up`).
///
/// Each transfer phase runs requests on a worker thread against a shared
/// byte counter while the calling thread samples the counter at a fixed
/// interval. Individual request failures are tolerated; a phase that never
/// moves a byte reports a zero aggregate.
pub struct HttpWorkload {
    cfg: RunConfig,
    http: Option<reqwest::blocking::Client>,
    server: Option<ServerInfo>,
    isp: Option<String>,
    ping_ms: f64,
    jitter_ms: Option<f64>,
    packet_loss: Option<f64>,
    download_bps: f64,
    upload_bps: f64,
}

impl HttpWorkload {
    pub fn new(cfg: RunConfig) -> Result<Self> {
        Ok(Self {
            cfg,
            http: None,
            server: None,
            isp: None,
            ping_ms: 0.0,
            jitter_ms: None,
            packet_loss: None,
            download_bps: 0.0,
            upload_bps: 0.0,
        })
    }

    /// Building a blocking client spawns reqwest's internal runtime thread
    /// and must not happen on an async worker, so it is deferred to the
    /// first stage call.
    fn client(&mut self) -> Result<reqwest::blocking::Client> {
        if let Some(http) = &self.http {
            return Ok(http.clone());
        }
        let http = reqwest::blocking::Client::builder()
            .user_agent(self.cfg.user_agent.clone())
            .timeout(Duration::from_secs(20))
            .build()
            .context("build HTTP client")?;
        self.http = Some(http.clone());
        Ok(http)
    }

    fn base(&self) -> &str {
        self.cfg.base_url.trim_end_matches('/')
    }

    fn down_url(&self, bytes: u64) -> String {
        format!("{}/__down?bytes={}", self.base(), bytes)
    }

    fn up_url(&self) -> String {
        format!("{}/__up", self.base())
    }

    fn meta_url(&self) -> String {
        format!("{}/meta", self.base())
    }
}

impl Workload for HttpWorkload {
    fn find_server(&mut self) -> Result<ServerInfo> {
        let http = self.client()?;
        let meta: Meta = http
            .get(self.meta_url())
            .send()
            .context("request server metadata")?
            .error_for_status()
            .context("server metadata request rejected")?
            .json()
            .context("parse server metadata")?;

        self.isp = meta.as_organization.filter(|s| !s.is_empty());
        let colo = meta.colo.unwrap_or_default();
        let server = ServerInfo {
            sponsor: Some(OPERATOR.to_string()),
            city: colo.city.filter(|s| !s.is_empty()),
            country: colo.cca2.filter(|s| !s.is_empty()),
        };
        self.server = Some(server.clone());
        Ok(server)
    }

    fn ping(&mut self, _server: &ServerInfo) -> Result<()> {
        let http = self.client()?;
        let url = self.down_url(0);
        let mut rtts: Vec<f64> = Vec::with_capacity(self.cfg.ping_samples as usize);
        let mut failed = 0u32;

        for _ in 0..self.cfg.ping_samples {
            let started = Instant::now();
            match http.get(&url).send().and_then(|r| r.error_for_status()) {
                Ok(resp) => {
                    let _ = resp.bytes();
                    rtts.push(started.elapsed().as_secs_f64() * 1000.0);
                }
                Err(e) => {
                    failed += 1;
                    log::debug!("ping probe failed: {e}");
                }
            }
        }

        if self.cfg.ping_samples > 0 {
            self.packet_loss =
                Some(f64::from(failed) / f64::from(self.cfg.ping_samples) * 100.0);
        }
        if !rtts.is_empty() {
            let mut sorted = rtts.clone();
            sorted.sort_by(f64::total_cmp);
            self.ping_ms = sorted[sorted.len() / 2];
        }
        if rtts.len() >= 2 {
            let diffs: f64 = rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
            self.jitter_ms = Some(diffs / (rtts.len() - 1) as f64);
        }
        Ok(())
    }

    fn download(&mut self, on_progress: &mut dyn FnMut(TransferProgress)) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU64::new(0));

        let http = self.client()?;
        let url = self.down_url(self.cfg.download_bytes_per_req);
        let stop2 = stop.clone();
        let total2 = total.clone();
        let worker = std::thread::spawn(move || {
            let mut buf = vec![0u8; CHUNK_SIZE];
            while !stop2.load(Ordering::Relaxed) {
                let mut resp = match http
                    .get(&url)
                    .send()
                    .and_then(|r| r.error_for_status())
                {
                    Ok(r) => r,
                    Err(e) => {
                        log::debug!("download request failed: {e}");
                        std::thread::sleep(RETRY_BACKOFF);
                        continue;
                    }
                };
                loop {
                    match resp.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            total2.fetch_add(n as u64, Ordering::Relaxed);
                            if stop2.load(Ordering::Relaxed) {
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("download stream error: {e}");
                            break;
                        }
                    }
                }
            }
        });

        let started = Instant::now();
        while started.elapsed() < self.cfg.download_duration {
            std::thread::sleep(SAMPLE_INTERVAL);
            on_progress(TransferProgress {
                bytes_transferred: total.load(Ordering::Relaxed),
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        stop.store(true, Ordering::Relaxed);
        let _ = worker.join();
        let elapsed = started.elapsed().as_secs_f64();
        let bytes = total.load(Ordering::Relaxed);
        self.download_bps = if elapsed > 0.0 {
            bytes as f64 * 8.0 / elapsed
        } else {
            0.0
        };
        Ok(())
    }

    fn upload(&mut self, on_progress: &mut dyn FnMut(TransferProgress)) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU64::new(0));

        let http = self.client()?;
        let url = self.up_url();
        let bytes_per_req = self.cfg.upload_bytes_per_req;
        let chunk = Bytes::from(vec![0u8; CHUNK_SIZE]);
        let stop2 = stop.clone();
        let total2 = total.clone();
        let worker = std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                // Bytes count as the body is produced. Close enough to bytes
                // on the wire for live sampling, same as the aggregate.
                let body = reqwest::blocking::Body::sized(
                    ZeroBody::new(chunk.clone(), bytes_per_req, total2.clone()),
                    bytes_per_req,
                );
                if let Err(e) = http.post(&url).body(body).send() {
                    log::debug!("upload request failed: {e}");
                    std::thread::sleep(RETRY_BACKOFF);
                }
            }
        });

        let started = Instant::now();
        while started.elapsed() < self.cfg.upload_duration {
            std::thread::sleep(SAMPLE_INTERVAL);
            on_progress(TransferProgress {
                bytes_transferred: total.load(Ordering::Relaxed),
                elapsed_secs: started.elapsed().as_secs_f64(),
            });
        }

        stop.store(true, Ordering::Relaxed);
        let _ = worker.join();
        let elapsed = started.elapsed().as_secs_f64();
        let bytes = total.load(Ordering::Relaxed);
        self.upload_bps = if elapsed > 0.0 {
            bytes as f64 * 8.0 / elapsed
        } else {
            0.0
        };
        Ok(())
    }

    fn results(&mut self) -> Result<RawResults> {
        Ok(RawResults {
            ping_ms: self.ping_ms,
            jitter_ms: self.jitter_ms,
            download_bps: self.download_bps,
            upload_bps: self.upload_bps,
            packet_loss: self.packet_loss,
            server: self.server.clone(),
            isp: self.isp.clone(),
        })
    }
}

/// Upload body serving `remaining` zero bytes from a ring over one shared
/// chunk, counting every byte produced into the phase total.
struct ZeroBody {
    chunk: Bytes,
    remaining: u64,
    pos: usize,
    total: Arc<AtomicU64>,
}

impl ZeroBody {
    fn new(chunk: Bytes, len: u64, total: Arc<AtomicU64>) -> Self {
        Self {
            chunk,
            remaining: len,
            pos: 0,
            total,
        }
    }
}

impl Read for ZeroBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || self.chunk.is_empty() {
            return Ok(0);
        }
        let n = buf
            .len()
            .min(self.chunk.len() - self.pos)
            .min(self.remaining as usize);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos = (self.pos + n) % self.chunk.len();
        self.remaining -= n as u64;
        self.total.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_body_serves_exact_length_and_counts_bytes() {
        let total = Arc::new(AtomicU64::new(0));
        let chunk = Bytes::from(vec![0u8; 16]);
        let mut body = ZeroBody::new(chunk, 40, total.clone());

        let mut out = Vec::new();
        let copied = io::copy(&mut body, &mut out).unwrap();

        assert_eq!(copied, 40);
        assert_eq!(out.len(), 40);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(total.load(Ordering::Relaxed), 40);
    }

    #[test]
    fn zero_body_wraps_around_small_chunks() {
        let total = Arc::new(AtomicU64::new(0));
        let mut body = ZeroBody::new(Bytes::from(vec![0u8; 3]), 10, total.clone());

        let mut buf = [1u8; 4];
        let mut served = 0u64;
        loop {
            let n = body.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            served += n as u64;
        }
        assert_eq!(served, 10);
        assert_eq!(total.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn empty_chunk_ends_the_body() {
        let total = Arc::new(AtomicU64::new(0));
        let mut body = ZeroBody::new(Bytes::new(), 10, total);
        let mut buf = [0u8; 8];
        assert_eq!(body.read(&mut buf).unwrap(), 0);
    }
}
