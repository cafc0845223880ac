#![forbid(unsafe_code)]

// peerlimit library - probes how many data channels and media streams one
// peer-to-peer session sustains on a given real-time platform

pub mod config;
pub mod error;
pub mod logsink;
pub mod metrics;
pub mod report;
pub mod run;
pub mod session;
pub mod signal;
pub mod sweep;
pub mod transport;

pub use config::{Backend, HarnessConfig, RunTimings};
pub use error::{HarnessError, HarnessResult, TransportError, TransportResult};
pub use run::{RunReport, RunState, TestRun, TestRunConfig};
pub use sweep::{LimitSweep, ParameterKind, PlatformRunner, SweepParameter};
