//! Command-processor supervision for A2xx-class Adreno GPUs.
//!
//! A [`Device`] owns the command ring and keeps it in step with submitted
//! work. Every wait on the GPU (ring drain, core idle, timestamp retirement)
//! samples a set of progress registers; when they stop moving the device
//! runs a recovery pass that restarts the GPU, replays the queued work of
//! innocent contexts and blames the context that hung.

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod events;
pub mod family;
pub mod hang;
pub mod memstore;
pub mod property;
pub mod recovery;
pub mod ring;
pub mod setstate;
pub mod stats;
pub mod timestamp;
mod wait;
pub mod wake;

pub use backend::{
    DiagnosticSink, FaultInfo, LogDiagnosticSink, MapFlags, MemDesc, MmuBackend, NoMmu,
    NullPowerControl, PagetableId, PowerControl, PowerState, RegisterIo,
};
pub use config::{CpConfig, PlatformQuirks};
pub use context::{ContextFlags, ResetStatus};
pub use device::{
    CmdFlags, Device, DeviceResources, DeviceState, GlobalRegion, IbDesc, PowerStats,
};
pub use error::{status_code, CpError, CpResult};
pub use family::{ChipId, GpuFamily, GpuInfo, GpuRev, IrqEvents};
pub use memstore::{MemstoreField, SharedStatusBlock, MEMSTORE_SIZE};
pub use property::{DeviceInfo, DeviceRequest, Property, PropertyRequest, ShadowProp};
pub use ring::RingMemory;
pub use setstate::MmuFlags;
pub use stats::CpStatsSnapshot;
pub use timestamp::{timestamp_cmp, TimestampKind};
