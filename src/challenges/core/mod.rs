//! Core utilities shared by the challenge detector, the verification token
//! source, and the session layer.

pub mod analysis;
pub mod client;
pub mod reqwest_client;
pub mod timing;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{
    LineBuffer, MarkupSniffer, Utf8ChunkDecoder, apex_domain, cookie_scopes, looks_like_markup,
    markup_offset, origin_from_url,
};
pub use client::{UpstreamClientError, UpstreamHttpClient};
pub use reqwest_client::ReqwestUpstreamClient;
pub use timing::{PollOutcome, poll_until, random_between};
pub use types::{BodyStream, StreamingResponse, UpstreamRequest, UpstreamResponse};
