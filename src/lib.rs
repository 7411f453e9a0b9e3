//! # Diagram Contextualizer
//!
//! Job orchestration and annotation reconciliation for interactive
//! engineering diagrams.
//!
//! Given a selection of diagrams and candidate resources (assets and files),
//! the crate submits detection jobs in bounded chunks, polls them
//! concurrently, merges per-file results into a dual-source annotation
//! store without duplicates, keeps each file's review label in sync with its
//! annotations, and runs bulk review and per-file export commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Workflow    │──▶│ JobBatcher  │──▶│  JobPoller  │──▶│ Reconcile    │
//! │ (selection)  │   │  (chunks)   │   │ (per chunk) │   │ (per file)   │
//! └──────┬───────┘   └─────────────┘   └─────────────┘   └──────┬───────┘
//!        │ status fold                                          │ labels
//!        ▼                                                      ▼
//! ┌──────────────┐                  ┌───────────────────────────────────┐
//! │  Aggregate   │                  │ DiagramApi (HTTP / in-memory)     │
//! │  status      │                  │ detect · annotations · files      │
//! └──────────────┘                  └──────────────▲────────────────────┘
//!                                                  │
//!                        ┌─────────────────────────┴──────┐
//!                        │ Review (approve/reject/clear)  │
//!                        │ Export (convert per file)      │
//!                        └────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dgx plan --workflow ./workflow.json     # offline chunk plan
//! dgx run --workflow ./workflow.json      # detect + reconcile
//! dgx approve 101 102                     # confirm pending tags
//! dgx export 101 --prefix shared          # render with confirmed tags
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and wire shapes |
//! | [`error`] | API and pipeline error taxonomy |
//! | [`annotations`] | Dual-source annotation model and status normalization |
//! | [`entity`] | Resources to detection entities |
//! | [`labels`] | Label derivation and label patches |
//! | [`api`] | External service trait |
//! | [`http`] | REST implementation of the service |
//! | [`memory`] | In-memory implementation of the service |
//! | [`batcher`] | Chunking and idempotent submission |
//! | [`poller`] | Per-job poll loop |
//! | [`reconcile`] | Merging detections into annotations |
//! | [`review`] | Approve / reject / clear |
//! | [`export`] | Per-file export jobs |
//! | [`status`] | Aggregate workflow status |
//! | [`workflow`] | Workflow aggregate and runner |
//! | [`progress`] | Progress reporting on stderr |

pub mod annotations;
pub mod api;
pub mod batcher;
pub mod config;
pub mod entity;
pub mod error;
pub mod export;
pub mod http;
pub mod labels;
pub mod memory;
pub mod models;
pub mod poller;
pub mod progress;
pub mod reconcile;
pub mod review;
pub mod status;
pub mod workflow;
