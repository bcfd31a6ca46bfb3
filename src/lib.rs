//! jpip-client - An interactive JPIP client engine for Rust
//!
//! jpip-client fetches windows of remote JPEG 2000 images precinct by
//! precinct, keeps what it received in a shared ledger, and prefetches the
//! precincts the next windows are likely to need on a background thread.
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use jpip_client::{ClientConfig, LoopbackTransport, Point, RegularCodestream, Session, Size, ViewWindow};
//!
//! let transport = Arc::new(LoopbackTransport::new("map.jp2", RegularCodestream::new(4096, 4096)));
//! let session = Arc::new(Session::new(ClientConfig::new("map.jp2"), transport)?);
//! let prefetch = session.start_prefetch()?;
//!
//! let window = ViewWindow::region(Size::new(1024, 1024), Point::new(0, 0), Size::new(256, 256));
//! let decoded = session.get_window(&window, true)?;
//! println!("{} bytes, delivered {:?}", decoded.pixels.len(), decoded.window.region_size);
//!
//! if let Some(engine) = prefetch {
//!     engine.finish();
//! }
//! session.close_session()?;
//! # Ok::<(), jpip_client::Error>(())
//! ```
//!
//! ## Checking the Cache
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use jpip_client::{ClientConfig, LoopbackTransport, RegularCodestream, Session};
//! use jpip_client::{RegionRequest, Point, Size};
//!
//! # let transport = Arc::new(LoopbackTransport::new("map.jp2", RegularCodestream::new(4096, 4096)));
//! # let session = Session::new(ClientConfig::new("map.jp2"), transport)?;
//! let region = RegionRequest {
//!     components: None,
//!     discard_levels: 2,
//!     offset: Point::new(0, 0),
//!     size: Size::new(128, 128),
//!     layers: Some(3),
//! };
//! session.fetch_region(&region, false)?;
//! session.save_cache("map.cache")?;
//! # Ok::<(), jpip_client::Error>(())
//! ```

pub mod api;
pub mod cache;
pub mod channel;
pub mod codestream;
pub mod config;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod history;
pub mod logging;
pub mod loopback;
pub mod movement;
pub mod prefetch;
pub mod session;
pub mod speed;
pub mod types;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CacheDescriptor, DescriptorForm, DescriptorQualifier, LedgerStats, PrecinctLedger};
pub use channel::{Channel, Transport, TransportKind};
pub use codestream::{CodestreamIndex, HeaderParser, PrecinctAddress, RegularCodestream, RegularHeaderParser};
pub use config::{ClientConfig, PrefetchConfig, PrefetchStrategy};
pub use coordinator::PrefetchGate;
pub use decoder::{CoverageDecoder, Decoder};
pub use error::{Error, Result, TransportError};
pub use logging::init_logging;
pub use loopback::LoopbackTransport;
pub use movement::{Direction, MovementModel, MovementProbabilities};
pub use prefetch::{PrefetchEngine, PrefetchStats, ScalingModel};
pub use session::{DecodedWindow, RegionRequest, Session, SessionPhase};
pub use types::{Point, Rect, Size};
pub use window::{ComponentRange, RoundDirection, ViewWindow};
