//! # Atlas Serve
//!
//! Data-serving and similarity-search backend for embedding visualizations.
//!
//! A tabular dataset (JSON or JSON Lines) is loaded once, its image cells are
//! replaced with opaque tokens, and the result is served to a browser UI over
//! HTTP: the dataset as range-addressable Parquet, a metadata descriptor,
//! ad-hoc SQL, nearest-neighbor search against a pluggable backend, a small
//! JSON cache, a feedback log, and a self-contained static archive.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Source  │──▶│ Image tokens │──▶│ Asset store │
//! │ JSON/L   │   │  + metadata  │   │ cache/fb/zip│
//! └──────────┘   └──────────────┘   └──────┬──────┘
//!                                          │
//!             ┌──────────────┬─────────────┤
//!             ▼              ▼             ▼
//!       ┌──────────┐   ┌──────────┐   ┌──────────┐
//!       │  Query   │   │  Search  │   │   HTTP   │
//!       │ (SQLite) │   │ backends │   │  (axum)  │
//!       └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! atlas serve --config ./config/atlas.toml
//! atlas export --output ./atlas.zip
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | In-memory table and cell types |
//! | [`source`] | Dataset loading and identifiers |
//! | [`image_assets`] | Image cell tokenization and resolution |
//! | [`metadata`] | Descriptor served to the UI |
//! | [`encode`] | Parquet, Arrow IPC, JSON, and CSV encoders |
//! | [`store`] | Cache, feedback log, and archive export |
//! | [`query`] | Ad-hoc SQL and selection export |
//! | [`search`] | Nearest-neighbor orchestration and backends |
//! | [`projection`] | Linear 2-D projection of query vectors |
//! | [`range`] | Range-addressable blobs |
//! | [`workers`] | Bounded worker pool |
//! | [`app`] | Component assembly |
//! | [`server`] | HTTP routes |
//! | [`export`] | `atlas export` command |

pub mod app;
pub mod config;
pub mod encode;
pub mod export;
pub mod image_assets;
pub mod metadata;
pub mod models;
pub mod projection;
pub mod query;
pub mod range;
pub mod search;
pub mod server;
pub mod source;
pub mod store;
pub mod workers;
