//! Browser access over the Chrome DevTools Protocol.
//!
//! The browser is started by the operator with remote debugging enabled:
//!
//! ```bash
//! chromium --remote-debugging-port=9222
//! ```
//!
//! ```rust,ignore
//! let client = CdpClient::connect("http://localhost:9222", Duration::from_secs(30)).await?;
//! let page = client.new_page().await?;
//! page.navigate("https://example.com", Duration::from_secs(45)).await?;
//! ```

mod client;
mod error;
mod form;
mod page;
mod protocol;

pub use client::CdpClient;
pub use error::CdpError;
pub use form::*;
pub use page::PageSession;
pub use protocol::*;
