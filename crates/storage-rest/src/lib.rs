//! REST implementation of [`TableService`](cloudtable_storage::TableService).
//!
//! This crate provides [`HttpTableService`], which speaks the table
//! service's JSON protocol over HTTPS, and [`RestConnector`], which plugs it
//! into a [`StorageContext`](cloudtable_storage::StorageContext).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              TableStore<T> / ReferenceManager               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     RestConnector                           │
//! │        (one shared reqwest::Client per connector)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    HttpTableService                         │
//! │  RequestSigner │ wire (JSON rows) │ batch (multipart)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Table service endpoint                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires a reachable table endpoint.
//! use std::sync::Arc;
//! use cloudtable_storage::{StorageConfig, StorageContext, TableService};
//! use cloudtable_storage_rest::{RestClientConfig, RestConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StorageConfig::builder()
//!         .connection_string("UseDevelopmentStorage=true")
//!         .build();
//!     let connector = RestConnector::new(RestClientConfig::default())?;
//!     let context = Arc::new(StorageContext::new(config, Arc::new(connector)));
//!
//!     let orders = context
//!         .references()
//!         .table_reference("UseDevelopmentStorage=true", "Orders")
//!         .await?;
//!     let row = orders.service().retrieve(orders.name(), "sales", "widget-1").await?;
//!     println!("{row:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Status Mapping
//!
//! | HTTP status | Error |
//! | ----------- | ----- |
//! | 404 | `NotFound` (a missing row on retrieve is `Ok(None)`) |
//! | 409 | `AlreadyExists` (`TableAlreadyExists` on create is `Ok(false)`) |
//! | 412 | `Conflict` |
//! | 408, 500, 502, 504 | `Connection` |
//! | 429, 503 | `Unavailable` |
//! | transport timeout | `Timeout` |

#![deny(unsafe_code)]

pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod wire;

pub use auth::RequestSigner;
pub use client::HttpTableService;
pub use config::RestClientConfig;
pub use connector::RestConnector;
pub use error::RestError;
