//! # Book Tutor
//!
//! Backend for an AI-assisted book: a chat assistant grounded in the book's
//! chapters, plus personalized and translated chapter content.
//!
//! ## Architecture
//!
//! ```text
//!  request ──▶ server ──▶ chat / rag / personalize / translate
//!                               │
//!            ┌──────────────────┼──────────────────┐
//!            ▼                  ▼                  ▼
//!       ┌──────────┐     ┌─────────────┐     ┌──────────┐
//!       │ embedding│────▶│ vector_store│     │   llm    │
//!       │ (Cohere) │     │ (Qdrant)    │     │(OpenRouter)
//!       └──────────┘     └─────────────┘     └──────────┘
//!                               │
//!                         ┌─────┴─────┐
//!                         │  SQLite   │ sessions, profiles, cache
//!                         └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tutor init                            # create database
//! tutor chapters                        # show the catalog
//! tutor ask "What is a vector database?"
//! tutor serve                           # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema bootstrap |
//! | [`models`] | Core data types |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Vector index (Qdrant or SQLite) |
//! | [`llm`] | Chat-completion client |
//! | [`book`] | Chapter catalog and text |
//! | [`tools`] | Tools the assistant can call |
//! | [`agent`] | Tool-calling assistant loop |
//! | [`rag`] | Single-shot retrieval-augmented answers |
//! | [`chat`] | Sessions and persisted history |
//! | [`cache`] | TTL content cache |
//! | [`personalize`] | Profile-adapted chapter content |
//! | [`translate`] | Chapter translation |
//! | [`profile`] | Learner profiles |
//! | [`server`] | HTTP API |
//! | [`testing`] | In-process fake backends |

pub mod agent;
pub mod book;
pub mod cache;
pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod personalize;
pub mod profile;
pub mod rag;
pub mod server;
pub mod testing;
pub mod tools;
pub mod translate;
pub mod vector_store;
