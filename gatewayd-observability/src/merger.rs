use crate::exposition;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, bounded};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);

/// Periodically scrapes each plugin's metrics socket, tags every sample
/// with a `plugin` label, and publishes one merged exposition buffer.
///
/// Readers always see a complete buffer: the merge builds a fresh `Vec` and
/// swaps it in atomically.
pub struct MetricsMerger {
    addresses: DashMap<String, PathBuf>,
    output: ArcSwap<Vec<u8>>,
    period: Duration,
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl MetricsMerger {
    pub fn new(period: Duration) -> Self {
        Self {
            addresses: DashMap::new(),
            output: ArcSwap::from_pointee(Vec::new()),
            period,
            stop_tx: Mutex::new(None),
        }
    }

    /// Register a plugin's metrics socket. Re-registration is ignored.
    pub fn add(&self, plugin: &str, socket: &Path) {
        if self.addresses.contains_key(plugin) {
            warn!(plugin = plugin, socket = %socket.display(), "Plugin already registered");
            return;
        }
        self.addresses.insert(plugin.to_string(), socket.to_path_buf());
        debug!(plugin = plugin, socket = %socket.display(), "Plugin metrics socket registered");
    }

    pub fn remove(&self, plugin: &str) {
        self.addresses.remove(plugin);
    }

    /// The most recently merged exposition buffer.
    pub fn output(&self) -> Arc<Vec<u8>> {
        self.output.load_full()
    }

    /// Scrape every registered socket. Missing or non-socket paths are
    /// skipped; scrape failures are logged per plugin.
    pub fn read_metrics(&self) -> Vec<(String, Vec<u8>)> {
        let mut readings = Vec::new();
        for entry in self.addresses.iter() {
            let (plugin, socket) = (entry.key(), entry.value());
            let is_socket = std::fs::metadata(socket)
                .map(|meta| meta.file_type().is_socket())
                .unwrap_or(false);
            if !is_socket {
                continue;
            }
            match scrape_uds(socket) {
                Ok(body) => readings.push((plugin.clone(), body)),
                Err(err) => {
                    error!(plugin = %plugin, error = %err, "Failed to read plugin metrics");
                }
            }
        }
        readings
    }

    /// One merge pass: scrape, re-label, merge, publish.
    pub fn merge(&self) {
        let mut merged: BTreeMap<String, exposition::Family> = BTreeMap::new();

        for (plugin, body) in self.read_metrics() {
            let text = String::from_utf8_lossy(&body);
            let label_value = plugin.replace('-', "_");
            let mut count = 0usize;

            for (name, family) in exposition::parse_families(&text) {
                let target = merged.entry(name).or_default();
                if target.meta.is_empty() {
                    target.meta = family.meta;
                }
                for sample in &family.samples {
                    target
                        .samples
                        .push(exposition::inject_label(sample, "plugin", &label_value));
                }
                count += 1;
            }

            debug!(plugin = %plugin, families = count, "Processed and merged metrics");
        }

        self.output.store(Arc::new(exposition::encode(&merged).into_bytes()));
    }

    /// Start the periodic merge on a dedicated thread.
    pub fn start(self: &Arc<Self>) {
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        {
            let mut guard = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                warn!("Metrics merger already started");
                return;
            }
            *guard = Some(tx);
        }

        let merger = Arc::clone(self);
        std::thread::Builder::new()
            .name("metrics-merger".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(merger.period) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => merger.merge(),
                        _ => break,
                    }
                }
                debug!("Metrics merger stopped");
            })
            .expect("failed to spawn metrics merger thread");
    }

    pub fn stop(&self) {
        let mut guard = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.take() {
            let _ = tx.send(());
        }
    }
}

/// `GET /metrics` over a unix domain socket, returning the response body.
fn scrape_uds(socket: &Path) -> std::io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(SCRAPE_TIMEOUT))?;
    stream.set_write_timeout(Some(SCRAPE_TIMEOUT))?;

    stream.write_all(
        b"GET /metrics HTTP/1.1\r\nHost: plugins\r\nUser-Agent: gatewayd\r\nConnection: close\r\n\r\n",
    )?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;

    parse_http_body(&raw)
}

fn parse_http_body(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::{Error, ErrorKind};

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let body_start = match response.parse(raw) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(Error::new(ErrorKind::UnexpectedEof, "truncated response head"));
        }
        Err(err) => return Err(Error::new(ErrorKind::InvalidData, err)),
    };

    match response.code {
        Some(200) => {}
        code => {
            return Err(Error::other(format!("metrics endpoint returned {code:?}")));
        }
    }

    let chunked = response.headers.iter().any(|header| {
        header.name.eq_ignore_ascii_case("transfer-encoding")
            && std::str::from_utf8(header.value)
                .unwrap_or("")
                .to_ascii_lowercase()
                .contains("chunked")
    });

    let body = &raw[body_start..];
    if chunked { dechunk(body) } else { Ok(body.to_vec()) }
}

/// Minimal chunked-transfer decoder; the stream is already fully read.
fn dechunk(mut body: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::{Error, ErrorKind};

    let mut out = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|pair| pair == b"\r\n")
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "missing chunk size line"))?;
        let size_text = std::str::from_utf8(&body[..line_end])
            .map_err(|_| Error::new(ErrorKind::InvalidData, "bad chunk size"))?;
        let size = usize::from_str_radix(size_text.trim().split(';').next().unwrap_or(""), 16)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "bad chunk size"))?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if body.len() < size + 2 {
            return Err(Error::new(ErrorKind::UnexpectedEof, "truncated chunk"));
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}
