//! Candidate extraction + upstream practice-management source adapter.

use exsync_storage::FetchError;
use thiserror::Error;

mod extract;
mod source;

pub use extract::{
    classify_custom_field, extract, is_organization_name, is_placeholder, parse_name,
    ORGANIZATION_INDICATORS, PLACEHOLDER_VALUES,
};
pub use source::{
    ExternalSourceError, HttpSourceTransport, OAuthRefreshToken, PracticeSourceClient, SourceTransport,
    StaticToken, TokenProvider, TransportError, DEFAULT_PAGE_SIZE, MATTERS_RESOURCE,
};

pub const CRATE_NAME: &str = "exsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}
