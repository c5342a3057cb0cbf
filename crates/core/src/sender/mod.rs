// Copyright 2024 Ulvetanna Inc.

//! Sender side: the bundle database, homomorphic query evaluation, and the
//! request dispatcher.

mod bin_bundle;
mod db;
mod dispatcher;
mod query;

pub use bin_bundle::BinBundle;
pub use db::{InsertReport, SenderDb};
pub use dispatcher::SenderDispatcher;
pub use query::{process_query, QueryRequest};
