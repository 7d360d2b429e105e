//! # Usage Ledger
//!
//! Mirrors usage events from a read-only upstream database into a local
//! SQLite store, rolls them into hourly, daily, and per-owner counters, and
//! runs retrieval-augmented rows through a multi-scorer quality evaluation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  Raw source  │──▶│  Sync engine │──▶│ reference_rows   │
//! │  (MySQL, RO) │   │ classify+fold│   │ *_counters       │
//! └──────┬───────┘   └──────────────┘   └────────┬─────────┘
//!        │                                       │
//!        │           ┌──────────────┐            ▼
//!        └──────────▶│ Orchestrator │◀── evaluation_jobs
//!                    │  fan-out to  │
//!                    │   scorers    │──▶ evaluation_results
//!                    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! uledger init                         # create database
//! uledger sync incremental             # pull the next page of raw rows
//! uledger sync recompute --date 2024-01-01
//! uledger eval run --since 2024-01-01  # evaluate rag_retrieval rows
//! uledger report daily --date 2024-01-01
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types |
//! | [`payload`] | Typed raw payloads and owner metadata |
//! | [`classify`] | Injection mode and owner classification |
//! | [`raw_source`] | Upstream readers |
//! | [`checkpoint`] | Per-channel sync watermarks |
//! | [`reference`] | Reference row store |
//! | [`aggregate`] | Counter store (accumulate vs replace) |
//! | [`sync`] | Incremental sync and daily recompute |
//! | [`scorer`] | Scorer contract and concurrent fan-out |
//! | [`reconcile`] | Cross-validation of scorer groups |
//! | [`diagnostics`] | Narrative diagnostics collaborator |
//! | [`sanitize`] | Non-finite float coercion |
//! | [`results`] | Evaluation result store and tier scores |
//! | [`jobs`] | Durable evaluation job ledger |
//! | [`evaluate`] | Evaluation orchestrator |
//! | [`report`] | Read-side summaries |

pub mod aggregate;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod evaluate;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod payload;
pub mod raw_source;
pub mod reconcile;
pub mod reference;
pub mod report;
pub mod results;
pub mod sanitize;
pub mod scorer;
pub mod sync;
