//! Regate - authorizing reverse proxy driven by hot-reloaded Rego policies
//!
//! Every inbound request is authenticated, described as a JSON document and
//! evaluated against an entry policy. Allowed requests are forwarded to a
//! single backend with the policy decision attached as headers; everything
//! else is rejected, and any ambiguity fails closed.
//!
//! # Architecture
//!
//! - Policy files live in a directory watched for changes. Bursts of edits
//!   are debounced per file before the policy is recompiled.
//! - One identity provider is chosen at startup: an Azure AD tenant with
//!   Microsoft Graph lookups, or OpenID issuers with JWKS verification.
//! - The pipeline runs header cleanup, authentication, authorization and
//!   forwarding in that order.
//!
//! # Modules
//!
//! - [`filecache`] - debounced policy file cache
//! - [`policy`] - compiled policy cache and evaluation engine seam
//! - [`auth`] - identity providers
//! - [`request`] - per-request descriptor (the policy input)
//! - [`gateway`] - request pipeline and reverse proxy
//! - [`app`] - application context, listeners and shutdown
//! - [`config`] - command line and environment configuration
//! - [`metrics`] - OpenTelemetry instruments
//! - [`error`] - error types and HTTP status mapping

#![deny(missing_docs)]

pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod filecache;
pub mod gateway;
pub mod metrics;
pub mod policy;
pub mod request;

pub use app::Application;
pub use config::Config;
pub use error::{Error, Result};
