// error.rs — crate-wide error type.
//
// Four families surface to callers:
//   - configuration errors: bad shapes or parameters, caught on the host
//     before anything touches the device (`Config`);
//   - resource exhaustion: device allocation failures (`ResourceExhausted`);
//   - device/driver errors: anything wgpu reports for an operation
//     (`Device`, `Map`, `Compile`, `DeviceRequest`);
//   - call-time shape mismatches between host data and a buffer or job
//     (`ShapeMismatch`).
//
// wgpu has no numeric status codes. Its error text is carried in `detail`
// together with the name of the operation that raised it.

use thiserror::Error;

/// Errors raised by the engine and the spectral pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An invalid parameter or parameter combination, rejected host-side.
    #[error("invalid {param}: {message}")]
    Config { param: &'static str, message: String },

    /// The device could not satisfy an allocation.
    #[error("{op}: out of device memory allocating {bytes} bytes ({detail})")]
    ResourceExhausted { op: &'static str, bytes: u64, detail: String },

    /// Any other device-reported failure during `op`.
    #[error("{op}: device error: {detail}")]
    Device { op: &'static str, detail: String },

    /// Mapping a buffer for host access failed.
    #[error("{op}: buffer map failed")]
    Map {
        op: &'static str,
        #[source]
        source: wgpu::BufferAsyncError,
    },

    /// Host-supplied data does not match the size a buffer or job expects.
    #[error("{op}: expected {expected} elements, got {actual}")]
    ShapeMismatch { op: &'static str, expected: usize, actual: usize },

    /// Shader compilation or pipeline creation failed; `diagnostics` holds
    /// the compiler output.
    #[error("failed to compile `{label}`:\n{diagnostics}")]
    Compile { label: String, diagnostics: String },

    /// No adapter found for the requested backends.
    #[error("no suitable GPU adapter found for the requested backends")]
    NoSuitableAdapter,

    /// wgpu refused to create the logical device.
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("{what} is already initialized")]
    AlreadyInitialized { what: &'static str },

    #[error("{what} is not initialized")]
    NotInitialized { what: &'static str },

    /// The transform backend failed to plan or execute.
    #[error("{op}: transform backend error: {message}")]
    Transform { op: &'static str, message: String },
}

impl EngineError {
    pub(crate) fn config(param: &'static str, message: impl Into<String>) -> Self {
        EngineError::Config { param, message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
