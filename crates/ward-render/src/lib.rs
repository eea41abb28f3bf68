//! # ward-render
//!
//! Deterministic rendering of configuration templates from key-value data.
//!
//! Templates are parsed once into a [`Template`] and rendered against any
//! [`Lookup`] of key values. Rendering is pure: the same template and values
//! always produce the same bytes.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use ward_render::{ParseOptions, RenderOptions, Template};
//!
//! let template = Template::parse(
//!     "cluster_name = \"{{ keyOrDefault \"config/services/consul/datacenter\" \"unknown\" }}\"\n",
//!     &ParseOptions::default(),
//! )
//! .expect("valid template");
//!
//! let values = BTreeMap::from([(
//!     "config/services/consul/datacenter".to_string(),
//!     "eu-west".to_string(),
//! )]);
//! let rendered = template.render(&values, RenderOptions::default()).expect("render");
//! assert_eq!(rendered.contents, b"cluster_name = \"eu-west\"\n");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod parse;
pub mod template;

pub use error::{RenderError, RenderResult};
pub use parse::{DEFAULT_LEFT, DEFAULT_RIGHT, Delimiters, ParseOptions};
pub use template::{Lookup, MISSING_VALUE, RenderOptions, Rendered, Template};
