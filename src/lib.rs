//! Strawberry Disease Detection Pipeline
//!
//! This library provides the core functionality for leafscan: batch
//! ingestion of field-camera images from S3-compatible storage, YOLO
//! inference through an external service, severity assessment, and
//! retention of detection records and batch jobs.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
