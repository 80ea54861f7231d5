//! Scan stage: one scanner invocation per built image, retried on any error.

use std::sync::Arc;

use drydock_core::{retry, Attempted, RetryOn, RetryPolicy, ScanReport, ServiceImage, VulnerabilityScanner};

#[derive(Clone)]
pub struct ScanStage {
    scanner: Arc<dyn VulnerabilityScanner>,
    retry: RetryPolicy,
}

impl ScanStage {
    pub fn new(scanner: Arc<dyn VulnerabilityScanner>, retry: RetryPolicy) -> Self {
        Self { scanner, retry }
    }

    /// Scan the built artifact. Every scanner error counts as transient.
    pub async fn scan(&self, image: &ServiceImage) -> Attempted<ScanReport> {
        let operation = format!("scan {}", image.artifact.tagged());
        retry(&self.retry, &operation, RetryOn::AnyError, |_| {
            self.scanner.scan(&image.artifact)
        })
        .await
    }
}
