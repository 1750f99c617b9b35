//! # LiveTree Codec
//!
//! Data values and wire encodings for LiveTree.
//!
//! This crate provides:
//! - [`Value`], the JSON-like value stored at every location
//! - JSON encoding (text frames, canonical identifiers)
//! - CBOR encoding (binary frames)
//!
//! ## Usage
//!
//! ```
//! use livetree_codec::{from_cbor, from_json, to_cbor, to_json, Value};
//!
//! let value = Value::map([("name", Value::from("Ada")), ("age", Value::from(36))]);
//!
//! let text = to_json(&value).unwrap();
//! assert_eq!(text, r#"{"age":36,"name":"Ada"}"#);
//! assert_eq!(from_json::<Value>(&text).unwrap(), value);
//!
//! let bytes = to_cbor(&value).unwrap();
//! assert_eq!(from_cbor::<Value>(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod value;

pub use decoder::{from_cbor, from_json};
pub use encoder::{to_cbor, to_json};
pub use error::{CodecError, CodecResult};
pub use value::Value;
