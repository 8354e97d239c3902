//! Portable syscall enforcement engine
//!
//! The same decision the `sys_call_block` kernel program makes, expressed
//! with ordinary concurrent containers so it can be driven from any
//! interception point and exercised in tests.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Interception point (one call per syscall, per unit)        │
//! │                                                             │
//! │  SyscallEntry ──► Interceptor ──lookup──► RuleStore         │
//! │                       │                   (shared, RO)      │
//! │                       │ match                               │
//! │                       ▼                                     │
//! │               TerminationSignal (SIGKILL)                   │
//! │                       │ accepted                            │
//! │                       ▼                                     │
//! │               ScratchBuffer[unit] ──► EventProducer         │
//! └───────────────────────────────────────────┬─────────────────┘
//!                                             │ best effort
//!                                             ▼
//!                                       EventConsumer
//! ```
//!
//! | Kernel program        | Engine                 |
//! |-----------------------|------------------------|
//! | `FILTER_MAP`          | [`RuleStore`]          |
//! | `PROCESS_INFO_MAP`    | [`ScratchBuffer`]      |
//! | `SYSCALL_EVENTS`      | [`event_channel`]      |
//! | `bpf_send_signal`     | [`TerminationSignal`]  |

pub mod channel;
pub mod interceptor;
pub mod scratch;
pub mod store;

pub use channel::{event_channel, EventConsumer, EventProducer, Publish, DEFAULT_CAPACITY};
pub use interceptor::{
    Delivery, Interceptor, ProcessKiller, SignalError, SyscallEntry, TerminationSignal, Verdict,
};
pub use scratch::ScratchBuffer;
pub use store::{RuleStore, StoreError};
