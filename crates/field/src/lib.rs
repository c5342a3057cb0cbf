// Copyright 2024 Ulvetanna Inc.

//! Prime-field encoding layer for asymmetric private set intersection.
//!
//! Items and labels travel through the protocol as short sequences of elements
//! of `Z_p`, where `p` is the BFV plaintext modulus. This crate owns that
//! representation: bitstring packing and unpacking, scalar arithmetic modulo
//! `p`, and the polynomial routines (root products, Newton interpolation,
//! Horner evaluation) the sender database builds its bin polynomials from.

mod bitstring;
mod codec;
mod error;
mod felt;
mod poly;

pub use bitstring::{bit_copy, Bitstring, BitstringView};
pub use codec::{alg_item_label, from_field, label_part_count, to_field, AlgItemLabel};
pub use error::Error;
pub use felt::{Felt, Modulus};
pub use poly::{newton_interpolate, poly_eval, poly_from_roots};
