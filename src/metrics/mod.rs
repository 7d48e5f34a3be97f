//! Metrics module
//!
//! Prometheus metrics for the upload pipeline.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Histogram, HistogramVec,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "upload_gateway_uploads_total",
        "Total number of uploads",
        &["route", "outcome"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "upload_gateway_upload_bytes_total",
        "Total bytes read from upload sources"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "upload_gateway_upload_duration_seconds",
        "Upload duration in seconds",
        &["route"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_UPLOADS: CounterVec = register_counter_vec!(
        "upload_gateway_multipart_uploads_total",
        "Total multipart uploads",
        &["status"]
    ).unwrap();

    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "upload_gateway_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Compression metrics
    pub static ref COMPRESSION_INPUT_BYTES: Counter = register_counter!(
        "upload_gateway_compression_input_bytes_total",
        "Bytes fed into the gzip compressor"
    ).unwrap();

    pub static ref COMPRESSION_OUTPUT_BYTES: Counter = register_counter!(
        "upload_gateway_compression_output_bytes_total",
        "Bytes produced by the gzip compressor"
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "upload_gateway_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(route: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[route, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed or cancelled upload
pub fn record_upload_failure(route: &str, outcome: &str) {
    UPLOADS_TOTAL.with_label_values(&[route, outcome]).inc();
}

/// Record upload duration
pub fn record_upload_duration(route: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[route])
        .observe(duration_secs);
}

/// Record one compression run
pub fn record_compression(input_bytes: u64, output_bytes: u64) {
    COMPRESSION_INPUT_BYTES.inc_by(input_bytes as f64);
    COMPRESSION_OUTPUT_BYTES.inc_by(output_bytes as f64);
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Record a successful multipart upload
pub fn record_multipart_upload_success(parts_count: u32) {
    MULTIPART_UPLOADS.with_label_values(&["success"]).inc();
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record a failed multipart upload
pub fn record_multipart_upload_failure() {
    MULTIPART_UPLOADS.with_label_values(&["failure"]).inc();
}

/// Record an aborted (cancelled) multipart upload
pub fn record_multipart_upload_aborted() {
    MULTIPART_UPLOADS.with_label_values(&["aborted"]).inc();
}
