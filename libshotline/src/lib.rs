//! # shotline
//!
//! shotline is an event-processing engine for shot-by-shot data, written in Rust. A
//! single source (a detector readout, a file replay, a network stream) fills events into
//! a bounded ring of preallocated slots, a pool of workers evaluates a graph of named
//! processors on every event, and any number of viewers can look at recent events while
//! the pipeline is running.
//!
//! ## Installation
//!
//! Currently the only method of install is from source. If you have not used Rust
//! before, see the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! To build and install the CLI use `cargo install --path ./shotline_cli` from the top
//! level shotline repository. The library `libshotline` can be used directly to embed the
//! pipeline with your own sources and processors.
//!
//! ## Concepts
//!
//! - Event: everything recorded for one shot, identified by an [`event::EventId`] built
//! from a coarse timestamp and a fiducial. Events are allocated once per ring slot and
//! reused.
//! - Ring: the [`ring::EventSlotRing`]. Each slot cycles Free, Filling, Filled,
//! Processing and back to Free. When no slot is free the source either waits (`block`)
//! or overwrites the oldest unprocessed event (`overwrite`).
//! - Source: anything implementing [`source::Source`]. It runs on its own thread.
//! - Processors: named computations implementing [`processor::Processor`]. A processor
//! may depend on other processors and may have a condition (another processor whose
//! result must be true for it to run). Each processor runs at most once per event id,
//! no matter how many other processors ask for it.
//! - Workers: the [`worker::WorkerPool`] threads evaluating the graph on Filled slots.
//! - Pausing: every thread owns a [`pausable::PausableControl`]. Configuration reloads
//! pause the source and the workers between two events, swap the graph and resume, so no
//! event is lost or evaluated by two different graphs.
//!
//! ## Configuration
//!
//! The pipeline is configured with a YAML file. A template can be made with
//! `shotline_cli -p config.yml new`. The format is as follows:
//!
//! ```yml
//! ring_capacity: 8
//! backpressure: block
//! n_workers: 2
//! acquire_timeout_ms: 100
//! drain_timeout_ms: 5000
//! cache_depth: null
//! processors:
//! - name: pulse_energy
//!   condition: null
//!   operation:
//!     type: beamline_value
//!     key: pulse_energy
//! - name: has_beam
//!   condition: null
//!   operation:
//!     type: compare
//!     input: pulse_energy
//!     op: greater
//!     threshold: 1.2
//! ```
//!
//! - ring_capacity: Number of event slots. Fixed once the pipeline is created.
//! - backpressure: `block` or `overwrite`. Fixed once the pipeline is created.
//! - n_workers: Number of worker threads. Must be at least 1. Can be changed by a reload.
//! - acquire_timeout_ms: How long a thread waits for a slot before checking whether it
//! should pause or stop.
//! - drain_timeout_ms: How long a shutdown waits for the ring to empty.
//! - cache_depth: How many recent event ids each processor keeps results for. If `null`,
//! the ring capacity is used.
//! - processors: The list of built-in processors, see [`config::Operation`].
//!
//! ## Output
//!
//! The CLI writes a log file `shotline.log` in the working directory. Data errors (a
//! processor could not produce a result for one event) are not fatal; they are counted
//! per processor and summarized at the end of a run. Fatal errors stop the pipeline and
//! are reported with the event and processor they occurred in.
pub mod builtin;
pub mod config;
pub mod error;
pub mod event;
pub mod fault;
pub mod graph;
pub mod pausable;
pub mod pipeline;
pub mod processor;
pub mod result;
pub mod ring;
pub mod source;
pub mod status;
pub mod worker;
