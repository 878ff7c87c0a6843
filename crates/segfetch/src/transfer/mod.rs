//! HTTP transfer manager: resumable downloads with retry and backoff.

mod client;
mod manager;
mod range;

pub use client::create_client;
pub use manager::{TransferManager, TransferStrategy};
pub use range::{ContentRange, content_length, range_header, remote_length};
