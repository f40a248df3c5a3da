//! # Flow Orchestration
//!
//! Drives a linear pipeline of phases over a stream of inputs.
//!
//! ## Data flow
//!
//! ```text
//! client ──add_inputs──▶ head phase ─▶ … ─▶ tail phase
//!    ▲                                          │
//!    └────── flow_results / done / error ◀── Flow actor
//! ```
//!
//! Each phase is one worker actor or a converging group of them; inputs
//! are routed per element, end-of-input propagates phase by phase, and
//! the flow delivers exactly one terminal event per execution.

pub mod cache;
pub mod collector;
pub mod coordinator;
pub mod events;
pub mod pipeline;

mod converge;
mod worker;

pub use cache::CacheHandle;
pub use collector::{CollectError, ResultCollector};
pub use coordinator::{Flow, FlowHandle, FlowOptions, Xform};
pub use events::{FlowError, FlowEvent, FlowEventKind};
pub use pipeline::{ModuleFactory, PhaseHandle, PhaseSpec};
