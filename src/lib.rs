//! STEP to GLB conversion service.
//!
//! Clients upload CAD files straight to blob storage through presigned URLs,
//! confirm the upload, and poll status while a worker pool converts the file
//! into a GLB mesh with extracted scene metadata.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
