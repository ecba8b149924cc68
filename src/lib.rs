#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod actor;
pub mod cluster;
pub mod config;
pub mod error;
pub mod gossip;
pub mod mediator;
pub mod message;
pub mod registry;
pub mod router;
pub mod testkit;

pub use mediator::{Mediator, MediatorRef};
