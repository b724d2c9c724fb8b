//! Invokes the external helper process under its bit-exact JSON protocol:
//! `{identity, csr?, inventory}` on stdin, `{defer, msg, certificate, ca,
//! configuration}` on stdout, a 10 second hard deadline.

use std::process::Stdio;
use std::time::{Duration, Instant};

use provisioner_proto::error::HelperError;
use provisioner_proto::helper::{HelperReply, HelperRequest};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::metrics::Metrics;

const HELPER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HelperInvoker {
    helper_path: String,
    site: String,
    metrics: Metrics,
}

impl HelperInvoker {
    pub fn new(helper_path: String, site: String, metrics: Metrics) -> Self {
        Self {
            helper_path,
            site,
            metrics,
        }
    }

    pub async fn invoke(&self, request: &HelperRequest) -> Result<HelperReply, HelperError> {
        let started = Instant::now();
        let result = tokio::time::timeout(HELPER_TIMEOUT, self.run(request)).await;
        let elapsed = started.elapsed();
        self.metrics
            .helper_time
            .with_label_values(&[&self.site])
            .observe(elapsed.as_secs_f64());

        let reply = match result {
            Err(_elapsed) => {
                self.metrics
                    .helper_errors
                    .with_label_values(&[&self.site])
                    .inc();
                return Err(HelperError::Timeout);
            }
            Ok(Err(e)) => {
                self.metrics
                    .helper_errors
                    .with_label_values(&[&self.site])
                    .inc();
                return Err(e);
            }
            Ok(Ok(reply)) => reply,
        };

        Ok(reply)
    }

    async fn run(&self, request: &HelperRequest) -> Result<HelperReply, HelperError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| HelperError::Json(e.to_string()))?;

        let mut child = Command::new(&self.helper_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HelperError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HelperError::Spawn("helper process has no stdin".to_owned()))?;
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| HelperError::Spawn(format!("failed to write stdin: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HelperError::Spawn(format!("failed to wait on helper: {e}")))?;

        if !output.status.success() {
            return Err(HelperError::NonZeroExit(output.status.code().unwrap_or(-1)));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| HelperError::Json(e.to_string()))
    }
}
