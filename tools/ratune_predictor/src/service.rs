// SPDX-License-Identifier: GPL-2.0
//
// ratune_predictor: socket serving loop.
//
// Single-threaded accept loop over a Unix stream socket. Requests are
// stateless; the only thing carried across them is a prediction counter
// used for the periodic diagnostic log line. A bad request costs that
// one connection, never the service.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use ratune_core::model::{Classifier, NormParams};
use ratune_core::proto::{encode_response, read_request};

/// How long the accept loop sleeps when no connection is pending. Also
/// bounds shutdown latency.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Per-connection read/write timeout. A stalled client cannot wedge the
/// single-threaded loop for longer than this.
const CLIENT_TIMEOUT: Duration = Duration::from_millis(500);

/// Log one diagnostic line every this many predictions.
const LOG_EVERY: u64 = 100;

pub struct PredictorService {
    classifier: Box<dyn Classifier>,
    params: NormParams,
    listener: UnixListener,
    sock_path: PathBuf,
    predictions: u64,
}

impl PredictorService {
    /// Bind the well-known socket. Artifacts are loaded and validated
    /// by the caller before this point; nothing is accepted until the
    /// model is known-good.
    pub fn bind(
        sock_path: impl AsRef<Path>,
        classifier: Box<dyn Classifier>,
        params: NormParams,
    ) -> Result<Self> {
        let sock_path = sock_path.as_ref().to_path_buf();

        // A previous instance that died uncleanly leaves its socket
        // behind; bind() would fail on it.
        if sock_path.exists() {
            fs::remove_file(&sock_path)
                .with_context(|| format!("removing stale socket {}", sock_path.display()))?;
        }

        let listener = UnixListener::bind(&sock_path)
            .with_context(|| format!("binding {}", sock_path.display()))?;
        listener.set_nonblocking(true)?;

        // The collector runs as root but test clients may not; the
        // socket is world-writable like the original daemon's.
        fs::set_permissions(&sock_path, fs::Permissions::from_mode(0o666))?;

        info!("listening on {}", sock_path.display());

        Ok(Self {
            classifier,
            params,
            listener,
            sock_path,
            predictions: 0,
        })
    }

    /// Accept and answer requests until the shutdown flag is raised.
    pub fn serve(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.handle_client(stream) {
                        warn!("request failed: {e:#}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                // Transient accept failures (client gone before accept,
                // fd pressure) cost one connection, never the service.
                Err(e) => {
                    warn!("accept failed: {e}");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        }

        info!("shutting down after {} predictions", self.predictions);
        Ok(())
    }

    pub fn predictions(&self) -> u64 {
        self.predictions
    }

    /// One request/response exchange. Malformed payloads and inference
    /// failures close the connection without a response.
    fn handle_client(&mut self, mut stream: UnixStream) -> Result<()> {
        let start = Instant::now();
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

        let raw = read_request(&mut stream).context("malformed request")?;
        let normalized = self.params.normalize(&raw);
        let prediction = self.classifier.classify(&normalized)?;

        use std::io::Write;
        stream
            .write_all(&encode_response(prediction.class))
            .context("sending prediction")?;

        self.predictions += 1;
        if self.predictions % LOG_EVERY == 0 {
            info!(
                "[{}] {} in {}us (dist={:.0} jump={:.3} size={:.0})",
                self.predictions,
                prediction.class,
                start.elapsed().as_micros(),
                raw[0],
                raw[1],
                raw[2],
            );
        } else {
            debug!(
                "{} scores={:?} in {}us",
                prediction.class,
                prediction.scores,
                start.elapsed().as_micros()
            );
        }

        Ok(())
    }
}

impl Drop for PredictorService {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.sock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use ratune_core::model::{DenseLayer, IoClass, MlpClassifier, ModelArtifact};
    use ratune_core::proto::{encode_request, PredictorClient};
    use ratune_core::{NUM_CLASSES, NUM_FEATURES};

    fn zero_layer(inputs: usize, outputs: usize) -> DenseLayer {
        DenseLayer {
            weights: vec![vec![0.0; inputs]; outputs],
            bias: vec![0.0; outputs],
        }
    }

    /// 5→32→16→3 network routing seq_ratio to class 0 and jump_ratio
    /// to class 1, with a small fixed bias on class 2.
    fn routing_artifact() -> ModelArtifact {
        let mut l0 = zero_layer(NUM_FEATURES, 32);
        l0.weights[0][3] = 1.0;
        l0.weights[1][1] = 1.0;
        let mut l1 = zero_layer(32, 16);
        l1.weights[0][0] = 1.0;
        l1.weights[1][1] = 1.0;
        let mut l2 = zero_layer(16, NUM_CLASSES);
        l2.weights[0][0] = 1.0;
        l2.weights[1][1] = 1.0;
        l2.bias[2] = 0.25;
        ModelArtifact {
            layers: vec![l0, l1, l2],
        }
    }

    fn identity_norm() -> NormParams {
        NormParams {
            mean: vec![0.0; NUM_FEATURES],
            std: vec![1.0; NUM_FEATURES],
        }
    }

    struct RunningService {
        shutdown: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<u64>>,
        sock: PathBuf,
        _dir: tempfile::TempDir,
    }

    impl RunningService {
        fn start() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let sock = dir.path().join("predictor.sock");
            let classifier =
                Box::new(MlpClassifier::from_artifact(routing_artifact()).unwrap());
            let mut service =
                PredictorService::bind(&sock, classifier, identity_norm()).unwrap();

            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            let handle = std::thread::spawn(move || {
                service.serve(&flag).unwrap();
                service.predictions()
            });

            Self {
                shutdown,
                handle: Some(handle),
                sock,
                _dir: dir,
            }
        }

        fn stop(mut self) -> u64 {
            self.shutdown.store(true, Ordering::Relaxed);
            self.handle.take().unwrap().join().unwrap()
        }
    }

    impl Drop for RunningService {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::Relaxed);
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    #[test]
    fn serves_predictions_end_to_end() {
        let service = RunningService::start();
        let client = PredictorClient::new(&service.sock, Duration::from_secs(1));

        // Pure sequential feature vector.
        let class = client.predict(&[4096.0, 0.0, 4096.0, 1.0, 40.0]).unwrap();
        assert_eq!(class, IoClass::Sequential);

        // Pure random feature vector.
        let class = client
            .predict(&[2_000_000.0, 1.0, 4096.0, 0.0, 40.0])
            .unwrap();
        assert_eq!(class, IoClass::Random);

        assert_eq!(service.stop(), 2);
    }

    #[test]
    fn identical_requests_get_identical_answers() {
        let service = RunningService::start();
        let client = PredictorClient::new(&service.sock, Duration::from_secs(1));

        let features = [123.0, 0.4, 8192.0, 0.6, 12.5];
        let first = client.predict(&features).unwrap();
        let second = client.predict(&features).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_feature_vector_still_gets_a_class() {
        let service = RunningService::start();
        let client = PredictorClient::new(&service.sock, Duration::from_secs(1));
        // Empty-window vector must not crash or error out.
        client.predict(&[0.0; NUM_FEATURES]).unwrap();
    }

    #[test]
    fn malformed_request_closes_without_response() {
        let service = RunningService::start();

        let mut stream = loop {
            match UnixStream::connect(&service.sock) {
                Ok(s) => break s,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        };
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream.write_all(&[1, 2, 3]).unwrap();
        // Half-close so the daemon sees EOF after the short payload.
        stream
            .shutdown(std::net::Shutdown::Write)
            .unwrap();

        let mut buf = [0u8; 4];
        // Connection is closed with no response bytes.
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        // The daemon is still alive and serving.
        let client = PredictorClient::new(&service.sock, Duration::from_secs(1));
        client.predict(&[0.0, 0.0, 0.0, 1.0, 1.0]).unwrap();

        assert_eq!(service.stop(), 1);
    }

    #[test]
    fn survives_clients_vanishing_before_accept() {
        let service = RunningService::start();

        // Connect and hang up immediately, repeatedly, so the accept
        // loop keeps meeting sockets whose peer is already gone.
        for _ in 0..20 {
            if let Ok(s) = UnixStream::connect(&service.sock) {
                drop(s);
            }
        }
        std::thread::sleep(Duration::from_millis(300));

        // Still alive and answering.
        let client = PredictorClient::new(&service.sock, Duration::from_secs(1));
        client.predict(&[4096.0, 0.0, 4096.0, 1.0, 40.0]).unwrap();
    }

    #[test]
    fn stale_socket_is_replaced_on_bind() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("predictor.sock");
        std::fs::write(&sock, b"stale").unwrap();

        let classifier = Box::new(MlpClassifier::from_artifact(routing_artifact()).unwrap());
        let _service = PredictorService::bind(&sock, classifier, identity_norm()).unwrap();
        assert!(sock.exists());
    }

    #[test]
    fn any_valid_request_yields_class_in_range() {
        let service = RunningService::start();

        // Raw protocol exchange, independent of the client helper.
        let mut stream = UnixStream::connect(&service.sock).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
            .write_all(&encode_request(&[1e12, -3.0, 0.0, 7.5, 1e-9]))
            .unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        let idx = i32::from_le_bytes(buf);
        assert!((0..3).contains(&idx));
    }
}
