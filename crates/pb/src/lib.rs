//! Protobuf types for the Prometheus remote storage protocol and their
//! conversions to and from the internal data model.

mod convert;
pub mod remote;

pub use convert::Converter;
