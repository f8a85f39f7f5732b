//! Ring engine
//!
//! Provides:
//! - Capture and transmit loops driving one ring each
//! - Packet sinks and transmit payload sources
//! - The orchestrator running one pinned worker per queue

mod affinity;
mod capture;
mod orchestrator;
mod payload;
mod sink;
mod stop;
mod transmit;

pub use affinity::{cpu_count, pin_current_thread};
pub use capture::{BlockOutcome, CaptureLoop};
pub use orchestrator::{
    fanout_group_id, plan_queues, EngineGroup, EngineSettings, Orchestrator, QueueContext,
    QueueFactory, QueuePlan, QueueReport, Workload,
};
pub use payload::{PayloadSource, StaticPayload, TCP_SYN_FRAME};
pub use sink::{
    format_timestamp, hex_prefix, AcceptAll, Classifier, FilteredSink, LogSink, PacketSink,
    LOG_PREFIX_LEN,
};
pub use stop::StopFlag;
pub use transmit::{DrainReport, TransmitLoop, TransmitSettings};
