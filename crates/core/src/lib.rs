// Copyright 2024 Ulvetanna Inc.

//! Asymmetric private set intersection over BFV homomorphic encryption.
//!
//! A receiver holding a small set of items learns which of them appear in a
//! much larger sender set (optionally retrieving a label per match) while
//! neither side reveals its set. Receiver items are hidden behind an
//! elliptic-curve OPRF; sender items live in a cuckoo-hashed database of
//! bin-wise interpolation polynomials that are evaluated homomorphically on
//! the receiver's encrypted query, decrypting to zero exactly at matches.
//!
//! The crate is split along the protocol roles: [`sender`] owns the bundle
//! database, query evaluation and the request dispatcher; [`receiver`]
//! builds queries and decodes results; [`oprf`], [`cuckoo`], [`powers`] and
//! [`crypto`] are the shared mechanisms underneath; [`network`] is the wire
//! format and channel abstraction.

pub mod crypto;
pub mod cuckoo;
mod error;
pub mod item;
pub mod network;
pub mod oprf;
pub mod params;
pub mod powers;
pub mod receiver;
pub mod sender;

pub use error::Error;
pub use item::{HashedItem, Item, LabelKey};
pub use params::{BfvParams, ItemParams, PsiParams, QueryParams, TableParams};
pub use receiver::{MatchRecord, Receiver};
pub use sender::{SenderDb, SenderDispatcher};
