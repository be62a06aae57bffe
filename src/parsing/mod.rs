//! Decoders for the non-standard formats Windows emits
//!
//! PowerShell error streams arrive as CLIXML, and `ConvertTo-Json` renders
//! several .NET and CIM types in shapes serde cannot decode directly. Each
//! wrapper type here implements [`serde::Deserialize`] so it can be used as a
//! field type in caller-defined result structs:
//!
//! ```
//! use psremote::parsing::{CimIpAddress, DotnetTime};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! #[serde(rename_all = "PascalCase")]
//! struct Lease {
//!     ip_address: CimIpAddress,
//!     lease_expiry_time: DotnetTime,
//! }
//!
//! let lease: Lease = serde_json::from_str(
//!     r#"{"IpAddress": 861627402, "LeaseExpiryTime": "\/Date(1701379505092)\/"}"#,
//! ).unwrap();
//! assert_eq!(lease.ip_address.to_string(), "10.100.91.51");
//! ```

pub mod cim;
pub mod clixml;
pub mod dotnet;

pub use cim::{CimClassKeyVal, CimIpAddress, CimTimeDuration};
pub use dotnet::DotnetTime;

use thiserror::Error;

/// Errors produced by the output decoders
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("not a CLIXML document")]
    NotClixml,

    #[error("malformed CLIXML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid .NET date {input:?}: {reason}")]
    DotnetTime { input: String, reason: String },

    #[error("invalid CIM duration: {0}")]
    CimDuration(String),

    #[error("invalid CIM key/value blob: {0}")]
    CimKeyVal(String),

    #[error("invalid integer IP address {input:?}: {reason}")]
    CimIpAddress { input: String, reason: String },
}

/// Result type for decoder operations
pub type ParseResult<T> = Result<T, ParseError>;
