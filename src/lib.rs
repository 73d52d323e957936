//! # chaos
//!
//! A personal web content repository. Notes, links, images, files, SQL
//! databases and listsets are stored as Markdown files with YAML
//! frontmatter; keywords relate items to each other; a small web UI and a
//! JSON API serve the collection, and `chaos sync` mirrors another instance.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Markdown   │──▶│  Relations  │   │ SQLite FTS5  │
//! │  item files │──▶│  (keywords) │   │ search index │
//! └──────┬──────┘   └──────┬──────┘   └──────┬───────┘
//!        │                 │                 │
//!        └────────┬────────┴────────┬────────┘
//!                 ▼                 ▼
//!            ┌──────────┐     ┌──────────┐
//!            │   CLI    │     │   HTTP   │
//!            │ (chaos)  │     │ UI + API │
//!            └──────────┘     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chaos init
//! chaos new note --title "Sourdough" --keywords baking,bread
//! chaos search sourdough
//! chaos serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Item kinds, refs, frontmatter |
//! | [`frontmatter`] | YAML frontmatter parsing and rendering |
//! | [`store`] | Filesystem item store |
//! | [`relations`] | Keyword relation graph |
//! | [`index`] / [`search`] | FTS5 index and search |
//! | [`database`] / [`plot`] | SQL database items and SVG charts |
//! | [`listset`] | Ordered item collections |
//! | [`auth`] | HTTP Basic authentication |
//! | [`server`] / [`views`] | Web UI and JSON API |
//! | [`sync`] / [`progress`] | Remote mirroring |
//! | [`export`] | Zip backup |
//! | [`db`] / [`migrate`] | Index connection and schema |

pub mod auth;
pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod export;
pub mod frontmatter;
pub mod index;
pub mod items;
pub mod listset;
pub mod migrate;
pub mod models;
pub mod plot;
pub mod progress;
pub mod relations;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod sync;
pub mod views;
