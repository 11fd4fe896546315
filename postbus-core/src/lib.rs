//! # postbus-core
//!
//! Runtime pieces shared by the postbus server and client:
//! - Connection state with serialized reads and writes
//! - Memory-bounded admission control
//! - Two-phase receive parsing (header, then deadline-bounded body)
//! - The ordered async filter pipeline and the built-in filters
//! - A shutdown gate for draining in-flight work

pub mod connection;
pub mod fault;
pub mod filter;
pub mod gate;
pub mod limits;
pub mod recv;

pub use connection::Connection;
pub use fault::{FaultDirective, FaultInjectionFilter, FAULT_HEADER};
pub use filter::{
    apply_filters, filter_fn, CompressionFilter, DecompressionFilter, Filter, FilterError,
    FilterFuture,
};
pub use gate::{Gate, GateGuard};
pub use limits::{AdmissionError, AdmissionPermit, ConnectionLimits};
pub use recv::{parse_header, parse_payload, ReceiveContext};
