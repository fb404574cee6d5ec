//! Live streaming data plane
//!
//! One session per logical channel, shared by every client watching it.
//! `gateway` is the entry point; `resolver` orders the candidate upstreams;
//! `session` pumps bytes; `prebuffer`/`rolling` smooth joins; `mpegts`
//! finds the packet boundaries that make joins decodable.

pub mod gateway;
pub mod mpegts;
pub mod prebuffer;
pub mod registry;
pub mod resolver;
pub mod rolling;
pub mod session;

pub use gateway::{StreamGateway, StreamHandle};
pub use registry::SessionRegistry;
pub use resolver::VariantResolver;
pub use session::{ClientMeta, SessionEvent, StreamSession};
