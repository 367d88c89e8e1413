//! Sender Policy Framework (RFC 4408) policy evaluation.
//!
//! Given an envelope identity, the connecting client's IP address, and
//! optionally a HELO identity, [`Server::process`] fetches the
//! authority domain's published policy over DNS, evaluates it, and
//! returns one of the seven SPF results. `fail` results carry the
//! macro-expanded authority explanation.
//!
//! DNS caching is the caller's responsibility. This library provides
//! a [`DnsResolver`] trait — implement it with caching at the
//! resolver layer, or use the bundled [`HickoryResolver`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use spf_policy::{HickoryResolver, Request, Server};
//!
//! # async fn check() {
//! let server = Server::new(Arc::new(HickoryResolver::new()));
//! let request = Request::mfrom("alice@example.com", "192.0.2.5".parse().unwrap())
//!     .with_helo("mail.example.com")
//!     .with_receiver("mx.receiver.example");
//! let result = server.process(&request).await;
//! println!("spf={result}");
//! # }
//! ```

pub mod dns;
pub mod domain;
pub mod macros;
pub mod mechanism;
pub mod net;
pub mod record;
pub mod request;
pub mod result;
pub mod server;

pub use dns::{DnsError, DnsResolver, HickoryResolver, MockResolver, MxHost};
pub use macros::{MacroContext, MacroString};
pub use mechanism::{Directive, DualCidr, Mechanism, Qualifier};
pub use record::{Modifier, Record, Term, Version};
pub use request::{Request, Scope};
pub use result::{SpfResult, SyntaxError};
pub use server::{Server, ServerOptions, DEFAULT_EXPLANATION};
