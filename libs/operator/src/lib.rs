//! The Eno synthesis control plane: the reconcilers governing
//! Composition/Synthesis lifecycle, plus the shared controller runtime
//! (stores, indices, metrics, telemetry) they are built on.

pub mod controller;
pub mod error;
pub mod index;
pub mod inputs;
pub mod metrics;
pub mod scheduler;
pub mod slices;
pub mod symphony;
pub mod synthesis;
pub mod telemetry;
pub mod watchdog;
