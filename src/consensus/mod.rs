//! The consensus DAG engine: vertices, milestone chains, orphan management,
//! and the manager that orchestrates admission, verification, and flushing.

pub mod chain;
pub mod chainset;
pub mod dag;
pub mod obc;
pub mod vertex;
pub mod worker;

pub use chain::{Chain, ChainLedger, VerifyError};
pub use chainset::ChainSet;
pub use dag::DagManager;
pub use obc::OrphanBlockContainer;
pub use vertex::{Milestone, RedemptionStatus, TxValidity, Vertex};
pub use worker::Worker;
