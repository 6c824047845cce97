// Copyright (c) 2026 The peerchain Authors. MIT License.
// See LICENSE for details.

//! # peerchain — Core Library
//!
//! Everything a peerchain node needs to join a permissioned network, stay
//! connected, agree on a master, and keep its chain height continuous.
//!
//! The network has two tiers. **Super nodes** are listed in a static roster,
//! carry higher connection ceilings, and are the only nodes eligible to be
//! master. **Normal nodes** discover peers through the super nodes and keep
//! a trust-scored peer table across restarts.
//!
//! ## Architecture
//!
//! - **config** — Protocol constants and the node configuration file.
//! - **storage** — Block structure and the key-value store behind the chain.
//! - **network** — Envelopes, connection registry, request correlation,
//!   dispatch, topology, master election, and block sync.
//!
//! ## Design Philosophy
//!
//! 1. No globals. Every service is constructed once and handed out as an
//!    `Arc`. `network::PeerNode` owns the wiring order and shutdown.
//! 2. Peers fail all the time. A failed dial is a trust decrement, never a
//!    crash.
//! 3. A block is validated before it touches disk, always, no matter which
//!    path delivered it.

pub mod config;
pub mod network;
pub mod storage;
