//! OpenTelemetry metrics ingestion: conversion of the OTLP
//! resource/scope/metric tree into internal time series, and the gRPC
//! `MetricsService` fronting it.

mod bridge;
mod service;

pub use bridge::OtelBridge;
pub use service::OtelMetricsService;
