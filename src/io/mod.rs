//! I/O layer - process management and transport
//!
//! Generic abstractions under the LSP layer:
//!
//! - **Transport**: ordered bidirectional message exchange
//! - **Process**: external server process lifecycle with stdio integration

pub mod process;
pub mod transport;

pub use process::{
    ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager, ProcessState,
    ServerProcess, StopMode,
};
pub use transport::{MockTransport, MockTransportHandle, StdioTransport, Transport};
