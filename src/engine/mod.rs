//! Decision core: consensus, risk supervision and the loops that drive them.
//!
//! ```text
//! Vote/Vestibular/Pulse ──► ConsensusEngine ──► Decision ──┐
//!                                ▲                          ▼
//!                                │                   ExecutionGateway
//!                                │                          │
//! Tick/Pulse ─────────► RiskSupervisor ──► Decision ──┘     │
//!                                ▲                          │
//!                                └──── ExecutionResult ◄────┘
//! ```
//!
//! Both components are single-owner structs driven by their own receive loop.
//! They share nothing but the refractory lock.

pub mod consensus;
pub mod risk;
pub mod runner;
