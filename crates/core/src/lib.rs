//! # Conflux Core
//!
//! A flow coordinator for flow-oriented parallel computation: a client
//! submits a pipeline description and a stream of inputs; the coordinator
//! drives the inputs through the pipeline's phases in parallel, collects
//! the results, and reports either success or a precise failure.
//!
//! ## Architecture
//!
//! - `module` - The [`PhaseModule`](module::PhaseModule) behavior contract
//!   user phases implement
//! - `flow` - Flow lifecycle, phase workers, converging groups, the
//!   per-flow cache, and client-side result collection
//!
//! Every phase worker and every flow is an independently scheduled tokio
//! task with a private mailbox; the only shared state is the per-flow
//! cache, addressed through the flow actor.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use conflux_core::flow::{Flow, FlowOptions, PhaseSpec, ResultCollector};
//! use conflux_core::module::FnPhase;
//! use std::time::Duration;
//!
//! let (client_tx, client_rx) = tokio::sync::mpsc::channel(64);
//! let pipeline = vec![
//!     PhaseSpec::new(|| Box::new(FnPhase::new(|v| Ok(vec![v])))),
//! ];
//! let mut flow = Flow::start(client_tx, "job-1", pipeline, FlowOptions::new()).await?;
//! flow.add_inputs(vec![1.into(), 2.into(), 3.into()]).await?;
//! flow.finish_inputs().await?;
//!
//! let results = ResultCollector::new("job-1", client_rx)
//!     .collect(Duration::from_secs(5))
//!     .await?;
//! ```

pub mod flow;
pub mod module;

pub use flow::{
    CacheHandle, CollectError, Flow, FlowError, FlowEvent, FlowEventKind, FlowHandle, FlowOptions,
    PhaseHandle, PhaseSpec, ResultCollector, Xform,
};
pub use module::{FnPhase, PhaseContext, PhaseModule};
