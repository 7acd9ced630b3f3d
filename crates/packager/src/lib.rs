//! # Packager
//!
//! Bundles recorded sessions into a package and delivers it, either as a
//! file or to a collector over HTTP(S).
//!
//! ## Delivery
//! - `Packager::select` resolves a `Criteria` against the repository
//! - closed fragments only; the live fragment of the active session is
//!   rolled over first
//! - one delivery at a time per packager; concurrent sends queue up
//! - `send_to_server_async` reports through `SendHandle` and
//!   `PackagerEvent::Completed`

pub mod error;
pub mod package;
pub mod packager;
pub mod transport;

pub use error::{PackagerError, Result};
pub use package::{
    ManifestFragment, ManifestSession, Package, PackageManifest, PACKAGE_EXTENSION,
    PACKAGE_FORMAT_VERSION, PACKAGE_MAGIC,
};
pub use packager::{
    DeliveryResult, Packager, PackagerEvent, PackagerState, SendHandle, SendOutcome,
    ServerSendOptions,
};
pub use transport::{Endpoint, HttpTransport, LocalTransport, RetryPolicy, Transport, Upload, DEFAULT_HUB};
