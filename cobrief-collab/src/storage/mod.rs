//! Persistent storage for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   operations    ┌──────────────┐
//! │ RealtimeHub │ ──────────────► │ DocumentStore│
//! │ (in-memory) │   checkpoints   │ (RocksDB)    │
//! └──────┬──────┘                 └──────┬───────┘
//!        │                               │
//!        │ on first touch                │ column families
//!        ▼                               ▼
//! ┌─────────────┐     ┌─────────────────────────────────────┐
//! │ Automerge   │     │ CF "documents"  — checkpoints (LZ4) │
//! │ (restored)  │     │ CF "operations" — operations log    │
//! └─────────────┘     │ CF "metadata"   — per-doc counters  │
//!                     └─────────────────────────────────────┘
//! ```
//!
//! [`DocumentStore`] also implements `DocumentBackend` directly, so a
//! single replica can persist without a hub in between.

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
