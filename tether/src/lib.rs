//! Socket-level connection management for long-lived TCP meshes.
//!
//! Two single-threaded reactors built on epoll:
//!
//! - [`Connections`](connections::Connections) keeps an outbound
//!   connection to every registered peer alive, reconnecting with
//!   jittered exponential backoff. In rotate mode it also retires
//!   healthy connections once per period so links never grow stale.
//! - [`EndpointProvider`](provider::EndpointProvider) publishes one
//!   listening address, adopts every inbound connection as a client,
//!   and evicts clients that stay silent past the heartbeat timeout.
//!
//! Both sides speak the same length-prefixed frame protocol
//! (`[kind: u8][len: u32 le][payload]`), deliver lifecycle and message
//! events synchronously from `poll()`, and expose a pollable
//! descriptor via `fd()` so they slot into an existing event loop.
//!
//! ```text
//!   caller threads                     poll thread
//!   --------------                     -----------
//!   add / send / broadcast  --lock-->  poll(timeout_ms, on_event)
//!                                       |- epoll_wait     (no lock)
//!                                       |- accept / read / write / tick
//!                                       '- on_event(...)  (no lock)
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]      | Pool and endpoint configuration, heartbeat defaults |
//! | [`connections`] | Outbound peer pool with deadline-driven reconnect |
//! | [`provider`]    | Inbound endpoint registry and failure detector |
//! | [`frame`]       | Wire format: frame encoding and incremental decode |
//! | [`error`]       | Crate-wide error enum |
//!
//! Internally the reactors share the `channel` (per-socket send queue
//! and decoder), `deadline` (earliest-due-first schedule), `poller`
//! (epoll wrapper), `socket` (non-blocking connect/accept/listen), and
//! `timer` (timerfd interval ticks) modules.

pub mod config;
pub mod connections;
pub mod error;
pub mod frame;
pub mod provider;

mod channel;
mod deadline;
mod poller;
mod socket;
mod timer;
