pub mod device;
pub mod host;
pub mod link;
pub mod metrics;
pub mod protocol;

pub use device::{CompletedRun, Device, DeviceConfig, DeviceError, ParameterKind, RunState};
pub use host::{prompt_parameters, run_test, HostConfig, HostError, RunTrace};
pub use link::{ByteLink, LineBuffer, MemoryLink};
#[cfg(feature = "serial")]
pub use link::{SerialConfig, SerialLink};
pub use metrics::{init_metrics, serve_metrics};
pub use protocol::{
    encode_parameter, format_decimal, format_sample, parse_parameter, parse_sample,
    ProtocolError, BEGIN_EXCHANGE, DEFAULT_BAUD, MAX_FIELD_LEN, READY_BANNER,
};
